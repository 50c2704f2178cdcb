//! Visibility memory: per-point observation tests and the memory integrator,
//! orchestrated once per frame by [`VisibilityEngine`].

pub mod config;
pub mod frame;
pub mod memory;
pub mod occlusion;
pub mod occluders;
pub mod drift;
pub mod engine;

pub use config::{DepthFallback, DispatchMode, OcclusionMode, VisibilityConfig};
pub use frame::{CameraFrame, DepthSnapshot};
pub use memory::MemoryIntegrator;
pub use occlusion::{Observation, OcclusionStrategy, OcclusionTester, RayQuery};
pub use occluders::OccluderSet;
pub use drift::Drift;
pub use engine::{CloudFrameStats, CloudId, CloudPhase, FrameReport, VisibilityEngine};
