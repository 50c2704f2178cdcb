//! Compute pipelines

pub mod visibility;

pub use visibility::{workgroup_count, VisibilityPipeline, WORKGROUP_SIZE};
