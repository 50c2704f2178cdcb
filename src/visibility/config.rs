//! Visibility engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::types::Result;
use crate::core::Error;

/// Which occlusion test runs on frustum-surviving points
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcclusionMode {
    /// Compare against an externally supplied scene-depth snapshot
    #[default]
    DepthSnapshot,
    /// Cast a ray from the camera to each point within the cull radius
    RayQuery,
}

/// What to do on frames without a depth snapshot (depth-snapshot mode only)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthFallback {
    /// Skip the update entirely; memory stays unchanged
    #[default]
    HoldMemory,
    /// Treat every frustum-surviving point as observed
    AssumeVisible,
}

/// Where per-point work executes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// rayon parallel-for over fixed-size batches
    #[default]
    Cpu,
    /// WGSL compute kernel, one invocation per point
    Gpu,
}

/// Recognized engine options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Rate (1/s) memory approaches 1 while observed
    pub learn_rate: f32,
    /// Rate (1/s) memory approaches 0 while unobserved
    pub forget_rate: f32,
    /// Max camera distance considered for occlusion testing
    pub cull_radius: f32,
    /// Depth/distance tolerance for "not blocked", in world units
    pub occlusion_epsilon: f32,
    /// Parallel dispatch granularity
    pub batch_group_size: usize,
    /// Bound on cosmetic positional jitter; 0 disables the final-position buffer
    pub drift_amplitude: f32,
    /// Angular frequency of the drift (radians per second)
    pub drift_frequency: f32,
    /// Starting memory value for newly activated clouds
    pub initial_memory: f32,
    pub occlusion_mode: OcclusionMode,
    pub depth_fallback: DepthFallback,
    pub dispatch: DispatchMode,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            learn_rate: 0.4,
            forget_rate: 0.2,
            cull_radius: 150.0,
            occlusion_epsilon: 0.05,
            batch_group_size: 64,
            drift_amplitude: 0.0,
            drift_frequency: 1.0,
            initial_memory: 0.0,
            occlusion_mode: OcclusionMode::DepthSnapshot,
            depth_fallback: DepthFallback::HoldMemory,
            dispatch: DispatchMode::Cpu,
        }
    }
}

impl VisibilityConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        fn non_negative(name: &str, value: f32) -> Result<()> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(Error::Config(format!("{} must be finite and >= 0, got {}", name, value)))
            }
        }

        non_negative("learn_rate", self.learn_rate)?;
        non_negative("forget_rate", self.forget_rate)?;
        non_negative("cull_radius", self.cull_radius)?;
        non_negative("occlusion_epsilon", self.occlusion_epsilon)?;
        non_negative("drift_amplitude", self.drift_amplitude)?;
        non_negative("drift_frequency", self.drift_frequency)?;

        if self.batch_group_size == 0 {
            return Err(Error::Config("batch_group_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.initial_memory) {
            return Err(Error::Config(format!(
                "initial_memory must lie in [0, 1], got {}",
                self.initial_memory
            )));
        }
        Ok(())
    }
}
