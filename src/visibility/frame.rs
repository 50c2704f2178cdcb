//! Per-frame camera snapshot and scene-depth input

use rayon::prelude::*;

use crate::core::types::{Mat4, Result, Vec2, Vec3, Vec4};
use crate::core::Error;
use crate::math::Ray;
use super::occlusion::RayQuery;

/// Camera state captured once per frame and shared by every cloud.
///
/// The view-projection must map depth to [0, 1] (glam `perspective_rh`).
#[derive(Clone, Debug)]
pub struct CameraFrame {
    pub view_projection: Mat4,
    /// Camera world position
    pub position: Vec3,
    pub near: f32,
    pub far: f32,
    /// Screen width in pixels
    pub width: u32,
    /// Screen height in pixels
    pub height: u32,
    /// Scene depth for this frame, if the producer had one ready
    pub depth: Option<DepthSnapshot>,
}

/// A world point after projection
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projected {
    /// Normalized device coordinates (x, y in [-1, 1], z in [0, 1] when inside)
    pub ndc: Vec3,
}

impl Projected {
    /// Inside the NDC cube
    pub fn in_frustum(&self) -> bool {
        self.ndc.x.abs() <= 1.0 && self.ndc.y.abs() <= 1.0 && (0.0..=1.0).contains(&self.ndc.z)
    }
}

impl CameraFrame {
    /// Project a world point; `None` when it lies on or behind the camera plane
    pub fn project(&self, world: Vec3) -> Option<Projected> {
        let clip = self.view_projection * Vec4::new(world.x, world.y, world.z, 1.0);
        if clip.w <= 0.0 {
            return None;
        }
        Some(Projected { ndc: clip.truncate() / clip.w })
    }

    /// Pixel containing an NDC position (row 0 at the top), clamped to the screen
    pub fn pixel(&self, ndc: Vec3) -> (u32, u32) {
        let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        let x = (uv.x * self.width as f32).floor().clamp(0.0, self.width.saturating_sub(1) as f32);
        let y = (uv.y * self.height as f32).floor().clamp(0.0, self.height.saturating_sub(1) as f32);
        (x as u32, y as u32)
    }

    /// Convert [0, 1] device depth to linear eye-space depth (world units)
    pub fn eye_depth(&self, device_depth: f32) -> f32 {
        let (n, f) = (self.near, self.far);
        (n * f) / (f - device_depth * (f - n))
    }
}

/// Scene depth aligned to the screen, valid for exactly one frame.
///
/// Values are device depth in [0, 1]; row 0 is the top of the screen.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthSnapshot {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl DepthSnapshot {
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 || values.len() != (width as usize) * (height as usize) {
            return Err(Error::Config(format!(
                "depth snapshot {}x{} needs {} values, got {}",
                width,
                height,
                (width as usize) * (height as usize),
                values.len()
            )));
        }
        Ok(Self { width, height, values })
    }

    /// Snapshot with every pixel at the same depth
    pub fn uniform(width: u32, height: u32, depth: f32) -> Result<Self> {
        Self::new(width, height, vec![depth; (width as usize) * (height as usize)])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Depth at a pixel, clamped to the image
    pub fn sample(&self, x: u32, y: u32) -> f32 {
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        self.values[y * self.width as usize + x]
    }

    /// Depth under an NDC position, using this snapshot's own resolution
    pub fn sample_ndc(&self, ndc: Vec3) -> f32 {
        let u = (ndc.x * 0.5 + 0.5) * self.width as f32;
        let v = (0.5 - ndc.y * 0.5) * self.height as f32;
        self.sample(u.max(0.0) as u32, v.max(0.0) as u32)
    }

    /// Build a snapshot by casting one ray per pixel centre into `scene`.
    /// Pixels with no hit get the far-plane depth 1.0.
    pub fn trace(view_projection: Mat4, width: u32, height: u32, scene: &dyn RayQuery) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config("depth snapshot needs a non-empty screen".to_string()));
        }

        let inverse = view_projection.inverse();
        let mut values = vec![1.0f32; (width as usize) * (height as usize)];

        values
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(row, line)| {
                let ndc_y = 1.0 - 2.0 * (row as f32 + 0.5) / height as f32;
                for (col, depth) in line.iter_mut().enumerate() {
                    let ndc_x = 2.0 * (col as f32 + 0.5) / width as f32 - 1.0;
                    let near = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
                    let far = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
                    let Some((ray, length)) = Ray::towards(near, far) else {
                        continue;
                    };
                    if let Some(t) = scene.nearest_hit(&ray, length) {
                        let hit = view_projection.project_point3(ray.at(t));
                        *depth = hit.z.clamp(0.0, 1.0);
                    }
                }
            });

        Self::new(width, height, values)
    }
}
