//! Per-point observation test: frustum filter, cull radius, then one of two
//! interchangeable occlusion strategies.

use std::fmt;
use std::sync::Arc;

use crate::core::types::Vec3;
use crate::math::Ray;
use super::config::{DepthFallback, OcclusionMode, VisibilityConfig};
use super::frame::CameraFrame;

/// Scene geometry that can answer "what is the first thing along this ray".
///
/// Implementations are shared across worker threads for the whole tick.
pub trait RayQuery: Send + Sync {
    /// Distance to the nearest hit within `max_distance`, if any
    fn nearest_hit(&self, ray: &Ray, max_distance: f32) -> Option<f32>;
}

/// Outcome of testing one point for one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Behind the camera or outside the view frustum
    OutsideFrustum,
    /// In the frustum but farther than the cull radius
    BeyondRange,
    /// No depth information this frame and memory is being held
    Unknown,
    /// Something in the scene is in front of the point
    Occluded,
    Observed,
}

impl Observation {
    /// Signal fed to the memory integrator
    pub fn signal(self) -> f32 {
        if self == Observation::Observed { 1.0 } else { 0.0 }
    }

    pub fn in_frustum(self) -> bool {
        self != Observation::OutsideFrustum
    }

    /// Whether an occlusion query was actually performed
    pub fn tested(self) -> bool {
        matches!(self, Observation::Occluded | Observation::Observed)
    }
}

/// Occlusion test applied to frustum-surviving points
#[derive(Clone)]
pub enum OcclusionStrategy {
    /// Compare against the frame's scene-depth snapshot
    DepthSnapshot(DepthFallback),
    /// Cast a ray from the camera to each point
    RayQuery(Arc<dyn RayQuery>),
}

impl fmt::Debug for OcclusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcclusionStrategy::DepthSnapshot(fallback) => {
                f.debug_tuple("DepthSnapshot").field(fallback).finish()
            }
            OcclusionStrategy::RayQuery(_) => f.write_str("RayQuery(..)"),
        }
    }
}

impl OcclusionStrategy {
    pub fn mode(&self) -> OcclusionMode {
        match self {
            OcclusionStrategy::DepthSnapshot(_) => OcclusionMode::DepthSnapshot,
            OcclusionStrategy::RayQuery(_) => OcclusionMode::RayQuery,
        }
    }
}

/// Stateless per-point tester; one per tick, shared by all worker threads
#[derive(Clone, Debug)]
pub struct OcclusionTester {
    strategy: OcclusionStrategy,
    epsilon: f32,
    cull_radius: f32,
}

impl OcclusionTester {
    pub fn new(strategy: OcclusionStrategy, config: &VisibilityConfig) -> Self {
        Self {
            strategy,
            epsilon: config.occlusion_epsilon,
            cull_radius: config.cull_radius,
        }
    }

    pub fn strategy(&self) -> &OcclusionStrategy {
        &self.strategy
    }

    pub fn cull_radius(&self) -> f32 {
        self.cull_radius
    }

    /// Depth mode is missing this frame's snapshot
    pub fn is_degraded(&self, frame: &CameraFrame) -> bool {
        matches!(self.strategy, OcclusionStrategy::DepthSnapshot(_)) && frame.depth.is_none()
    }

    /// Memory must not change this frame
    pub fn holds_memory(&self, frame: &CameraFrame) -> bool {
        self.is_degraded(frame)
            && matches!(self.strategy, OcclusionStrategy::DepthSnapshot(DepthFallback::HoldMemory))
    }

    /// Classify a world-space point
    pub fn test(&self, frame: &CameraFrame, world: Vec3) -> Observation {
        let Some(projected) = frame.project(world) else {
            return Observation::OutsideFrustum;
        };
        if !projected.in_frustum() {
            return Observation::OutsideFrustum;
        }

        let distance = world.distance(frame.position);
        if distance > self.cull_radius {
            return Observation::BeyondRange;
        }

        match &self.strategy {
            OcclusionStrategy::DepthSnapshot(fallback) => match &frame.depth {
                Some(depth) => {
                    let point = frame.eye_depth(projected.ndc.z);
                    let scene = frame.eye_depth(depth.sample_ndc(projected.ndc));
                    if point <= scene + self.epsilon {
                        Observation::Observed
                    } else {
                        Observation::Occluded
                    }
                }
                None => match fallback {
                    DepthFallback::HoldMemory => Observation::Unknown,
                    DepthFallback::AssumeVisible => Observation::Observed,
                },
            },
            OcclusionStrategy::RayQuery(scene) => {
                let Some((ray, distance)) = Ray::towards(frame.position, world) else {
                    return Observation::Observed;
                };
                match scene.nearest_hit(&ray, distance + self.epsilon) {
                    Some(t) if t < distance - self.epsilon => Observation::Occluded,
                    _ => Observation::Observed,
                }
            }
        }
    }
}
