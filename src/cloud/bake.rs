//! Offline point-cloud baking: area-weighted uniform sampling of a triangle mesh.
//!
//! 1. Per-triangle area and a cumulative distribution over triangles
//! 2. Target count `ceil(total_area * density)`
//! 3. Per sample: pick a triangle by inverse-CDF lookup, then a uniform
//!    barycentric point inside it

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::types::{Result, Vec3};
use crate::core::Error;
use super::asset::PointCloudAsset;

/// Reference sampling density in points per square unit
pub const DEFAULT_DENSITY: f32 = 300.0;

/// Triangle mesh input to the baker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshData {
    /// Source mesh name; becomes the asset key
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    /// Triangle index triples, flattened
    pub indices: Vec<u32>,
    /// Optional per-vertex normals (ignored unless parallel to positions)
    #[serde(default)]
    pub normals: Option<Vec<[f32; 3]>>,
}

impl MeshData {
    /// Read a mesh from a JSON file
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn triangle(&self, t: usize) -> [usize; 3] {
        [
            self.indices[t * 3] as usize,
            self.indices[t * 3 + 1] as usize,
            self.indices[t * 3 + 2] as usize,
        ]
    }

    fn vertex(&self, i: usize) -> Vec3 {
        Vec3::from_array(self.positions[i])
    }

    fn validate(&self) -> Result<()> {
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(Error::Asset(format!(
                "mesh '{}': index count {} is not a non-zero multiple of 3",
                self.name,
                self.indices.len()
            )));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= self.positions.len()) {
            return Err(Error::Asset(format!(
                "mesh '{}': index {} out of range for {} vertices",
                self.name,
                bad,
                self.positions.len()
            )));
        }
        Ok(())
    }
}

/// Baker parameters
#[derive(Clone, Copy, Debug)]
pub struct BakeSettings {
    /// Points per square unit of surface
    pub density: f32,
    /// RNG seed; identical seeds give identical clouds
    pub seed: u64,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            density: DEFAULT_DENSITY,
            seed: 0,
        }
    }
}

/// Number of samples for a surface of `area` at `density`
pub fn target_count(area: f32, density: f32) -> usize {
    (area * density).ceil().max(0.0) as usize
}

/// Map two uniform draws in [0, 1) to barycentric `(u, v)` inside the
/// triangle, reflecting draws that land in the far half of the unit square.
pub fn barycentric_sample(u: f32, v: f32) -> (f32, f32) {
    if u + v > 1.0 {
        (1.0 - u, 1.0 - v)
    } else {
        (u, v)
    }
}

/// Sample a point cloud off the mesh surface
pub fn bake(mesh: &MeshData, settings: &BakeSettings) -> Result<PointCloudAsset> {
    mesh.validate()?;

    if !(settings.density.is_finite() && settings.density > 0.0) {
        return Err(Error::Config(format!("bake density must be positive, got {}", settings.density)));
    }

    let normals = mesh
        .normals
        .as_ref()
        .filter(|n| n.len() == mesh.positions.len());

    let tri_count = mesh.indices.len() / 3;
    let mut cdf = Vec::with_capacity(tri_count);
    let mut total_area = 0.0f32;
    for t in 0..tri_count {
        let [a, b, c] = mesh.triangle(t);
        let (a, b, c) = (mesh.vertex(a), mesh.vertex(b), mesh.vertex(c));
        total_area += (b - a).cross(c - a).length() * 0.5;
        cdf.push(total_area);
    }

    if total_area <= 0.0 {
        return Err(Error::Asset(format!("mesh '{}' has zero surface area", mesh.name)));
    }

    let count = target_count(total_area, settings.density);
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut positions = Vec::with_capacity(count);
    let mut out_normals = Vec::with_capacity(count);

    for _ in 0..count {
        let r = rng.r#gen::<f32>() * total_area;
        let t = cdf.partition_point(|&c| c <= r).min(tri_count - 1);
        let [i0, i1, i2] = mesh.triangle(t);
        let (v0, v1, v2) = (mesh.vertex(i0), mesh.vertex(i1), mesh.vertex(i2));

        let (u, v) = barycentric_sample(rng.r#gen::<f32>(), rng.r#gen::<f32>());
        positions.push(v0 + u * (v1 - v0) + v * (v2 - v0));

        let normal = normals
            .map(|n| {
                let w0 = 1.0 - u - v;
                Vec3::from_array(n[i0]) * w0 + Vec3::from_array(n[i1]) * u + Vec3::from_array(n[i2]) * v
            })
            .and_then(|n| n.try_normalize())
            .unwrap_or(Vec3::Y);
        out_normals.push(normal);
    }

    log::info!(
        "Baked '{}': {} points from {} triangles, area {:.3} at density {}",
        mesh.name, count, tri_count, total_area, settings.density
    );

    PointCloudAsset::new(mesh.name.clone(), positions, Some(out_normals))
}

/// Axis-aligned box mesh (12 triangles), handy for demos and tests
pub fn box_mesh(name: &str, min: Vec3, max: Vec3) -> MeshData {
    let corners: Vec<[f32; 3]> = (0..8u8)
        .map(|i| {
            [
                if i & 1 != 0 { max.x } else { min.x },
                if i & 2 != 0 { max.y } else { min.y },
                if i & 4 != 0 { max.z } else { min.z },
            ]
        })
        .collect();

    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1,  1, 2, 3, // -z
        4, 5, 6,  5, 7, 6, // +z
        0, 1, 4,  1, 5, 4, // -y
        2, 6, 3,  3, 6, 7, // +y
        0, 4, 2,  2, 4, 6, // -x
        1, 3, 5,  3, 7, 5, // +x
    ];

    MeshData {
        name: name.to_string(),
        positions: corners,
        indices,
        normals: None,
    }
}
