//! Vismem - visibility memory for baked building point clouds
//!
//! Every point of a baked cloud carries a memory scalar in `[0, 1]` that rises
//! while the camera observes the point and decays while it does not.

pub mod core;
pub mod math;
pub mod cloud;
pub mod visibility;
pub mod render;
