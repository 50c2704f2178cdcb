//! Per-cloud uniform data for the visibility kernel

use bytemuck::{Pod, Zeroable};

use crate::core::types::Mat4;
use crate::visibility::{CameraFrame, DepthFallback, Drift, VisibilityConfig};

/// Kernel depth handling for one dispatch
pub const DEPTH_PRESENT: u32 = 0;
pub const DEPTH_HOLD: u32 = 1;
pub const DEPTH_ASSUME_VISIBLE: u32 = 2;

/// Uniform block (must match `Params` in shaders/visibility.wgsl)
/// WGSL vec3 has 16-byte alignment, so camera_position shares its slot with cull_radius
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniform {
    /// View-projection matrix (64 bytes, offset 0)
    pub view_proj: [[f32; 4]; 4],
    /// Cloud local-to-world transform (64 bytes, offset 64)
    pub model: [[f32; 4]; 4],
    /// Camera position in world space (12 bytes, offset 128)
    pub camera_position: [f32; 3],
    /// (offset 140)
    pub cull_radius: f32,
    pub near: f32,
    pub far: f32,
    /// Depth snapshot resolution (offset 152)
    pub depth_width: u32,
    pub depth_height: u32,
    /// Integrator (offset 160)
    pub learn_rate: f32,
    pub forget_rate: f32,
    pub dt: f32,
    pub epsilon: f32,
    /// Drift (offset 176)
    pub drift_amplitude: f32,
    pub point_count: u32,
    /// One of the DEPTH_* constants (offset 184)
    pub depth_mode: u32,
    pub _pad0: u32,
    /// Per-axis drift wave angle, already reduced to [0, TAU) (offset 192)
    pub drift_phase: [f32; 3],
    /// Final padding to 208 bytes
    pub _pad1: u32,
}

impl FrameUniform {
    pub fn new(
        frame: &CameraFrame,
        model: &Mat4,
        config: &VisibilityConfig,
        dt: f32,
        time: f64,
        point_count: u32,
    ) -> Self {
        let (depth_width, depth_height, depth_mode) = match &frame.depth {
            Some(depth) => (depth.width(), depth.height(), DEPTH_PRESENT),
            None => match config.depth_fallback {
                DepthFallback::HoldMemory => (1, 1, DEPTH_HOLD),
                DepthFallback::AssumeVisible => (1, 1, DEPTH_ASSUME_VISIBLE),
            },
        };

        Self {
            view_proj: frame.view_projection.to_cols_array_2d(),
            model: model.to_cols_array_2d(),
            camera_position: frame.position.to_array(),
            cull_radius: config.cull_radius,
            near: frame.near,
            far: frame.far,
            depth_width,
            depth_height,
            learn_rate: config.learn_rate,
            forget_rate: config.forget_rate,
            dt,
            epsilon: config.occlusion_epsilon,
            drift_amplitude: config.drift_amplitude,
            point_count,
            depth_mode,
            _pad0: 0,
            drift_phase: Drift::from_config(config).axis_phases(time),
            _pad1: 0,
        }
    }
}
