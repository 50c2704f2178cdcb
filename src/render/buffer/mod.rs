//! GPU buffer management

pub mod frame_uniform;
pub mod point_buffers;

pub use frame_uniform::{FrameUniform, DEPTH_ASSUME_VISIBLE, DEPTH_HOLD, DEPTH_PRESENT};
pub use point_buffers::{BufferStreamer, PointBuffers};
