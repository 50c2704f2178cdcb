//! GPU device, per-point buffers and the visibility kernel

pub mod context;
pub mod buffer;
pub mod pipeline;

pub use buffer::{BufferStreamer, FrameUniform, PointBuffers};
pub use context::GpuDevice;
pub use pipeline::VisibilityPipeline;
