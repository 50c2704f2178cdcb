//! Simple world-space occluder scene for the ray-query strategy

use crate::cloud::MeshData;
use crate::core::types::{Mat4, Vec3};
use crate::math::{Aabb, Ray};
use super::occlusion::RayQuery;

/// Boxes and triangles in world space.
///
/// Triangles sit behind a single broad-phase bounding box; boxes are tested
/// individually. Adequate for a handful of buildings, not a BVH.
#[derive(Clone, Debug, Default)]
pub struct OccluderSet {
    boxes: Vec<Aabb>,
    triangles: Vec<[Vec3; 3]>,
    triangle_bounds: Option<Aabb>,
}

impl OccluderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_box(&mut self, aabb: Aabb) {
        self.boxes.push(aabb);
    }

    pub fn add_triangle(&mut self, v0: Vec3, v1: Vec3, v2: Vec3) {
        let bounds = Aabb::from_points(&[v0, v1, v2]).unwrap_or_default();
        self.triangle_bounds = Some(match self.triangle_bounds {
            Some(existing) => existing.merged(&bounds),
            None => bounds,
        });
        self.triangles.push([v0, v1, v2]);
    }

    /// Add every triangle of a mesh placed with `transform`.
    /// Out-of-range indices and a trailing partial triangle are skipped.
    pub fn add_mesh(&mut self, mesh: &MeshData, transform: &Mat4) {
        let vertex = |i: u32| {
            mesh.positions
                .get(i as usize)
                .map(|&p| transform.transform_point3(Vec3::from_array(p)))
        };
        for tri in mesh.indices.chunks_exact(3) {
            if let (Some(a), Some(b), Some(c)) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2])) {
                self.add_triangle(a, b, c);
            }
        }
    }

    pub fn box_count(&self) -> usize {
        self.boxes.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty() && self.triangles.is_empty()
    }
}

impl RayQuery for OccluderSet {
    fn nearest_hit(&self, ray: &Ray, max_distance: f32) -> Option<f32> {
        let mut nearest: Option<f32> = None;
        let mut consider = |t: f32| {
            if t <= max_distance && nearest.is_none_or(|n| t < n) {
                nearest = Some(t);
            }
        };

        for aabb in &self.boxes {
            // Rays starting inside a box are not blocked by it
            if aabb.contains_point(ray.origin) {
                continue;
            }
            if let Some((t_near, _)) = ray.intersects_aabb(aabb) {
                consider(t_near);
            }
        }

        let broad_hit = self
            .triangle_bounds
            .as_ref()
            .and_then(|b| ray.intersects_aabb(b))
            .is_some_and(|(t_near, _)| t_near <= max_distance);
        if broad_hit {
            for [a, b, c] in &self.triangles {
                if let Some(t) = ray.intersects_triangle(*a, *b, *c) {
                    consider(t);
                }
            }
        }

        nearest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::bake::box_mesh;

    #[test]
    fn test_empty_scene() {
        let scene = OccluderSet::new();
        assert!(scene.is_empty());
        assert!(scene.nearest_hit(&Ray::new(Vec3::ZERO, Vec3::X), 100.0).is_none());
    }

    #[test]
    fn test_nearest_box() {
        let mut scene = OccluderSet::new();
        scene.add_box(Aabb::new(Vec3::new(10.0, -1.0, -1.0), Vec3::new(11.0, 1.0, 1.0)));
        scene.add_box(Aabb::new(Vec3::new(5.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0)));

        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        let t = scene.nearest_hit(&ray, 100.0).unwrap();
        assert!((t - 5.0).abs() < 1e-4);
        assert!(scene.nearest_hit(&ray, 4.0).is_none());
    }

    #[test]
    fn test_origin_inside_box_ignored() {
        let mut scene = OccluderSet::new();
        scene.add_box(Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)));
        assert!(scene.nearest_hit(&Ray::new(Vec3::ZERO, Vec3::Y), 10.0).is_none());
    }

    #[test]
    fn test_mesh_triangles() {
        let mut scene = OccluderSet::new();
        let mesh = box_mesh("block", Vec3::splat(-1.0), Vec3::splat(1.0));
        scene.add_mesh(&mesh, &Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0)));
        assert_eq!(scene.triangle_count(), 12);

        let ray = Ray::new(Vec3::ZERO, Vec3::NEG_Z);
        let t = scene.nearest_hit(&ray, 100.0).unwrap();
        assert!((t - 9.0).abs() < 1e-4, "hit at {}", t);

        // Broad phase rejects rays that miss the mesh bounds
        assert!(scene.nearest_hit(&Ray::new(Vec3::ZERO, Vec3::Z), 100.0).is_none());
    }
}
