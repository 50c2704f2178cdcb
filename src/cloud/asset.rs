//! Immutable baked point cloud data for one building

use crate::core::types::{Result, Vec3};
use crate::core::Error;
use crate::math::Aabb;

/// Ordered point positions (and optional parallel normals) in the
/// building's local space. Never mutated after baking.
#[derive(Clone, Debug, PartialEq)]
pub struct PointCloudAsset {
    name: String,
    positions: Vec<Vec3>,
    normals: Option<Vec<Vec3>>,
    bounds: Aabb,
}

impl PointCloudAsset {
    /// Create an asset. Normals, when given, must be parallel to positions.
    ///
    /// An empty position list is accepted here (the baker can legitimately
    /// produce one); the engine refuses to activate it.
    pub fn new(name: impl Into<String>, positions: Vec<Vec3>, normals: Option<Vec<Vec3>>) -> Result<Self> {
        let name = name.into();
        if let Some(normals) = &normals {
            if normals.len() != positions.len() {
                return Err(Error::Asset(format!(
                    "'{}': {} normals for {} positions",
                    name,
                    normals.len(),
                    positions.len()
                )));
            }
        }
        let bounds = Aabb::from_points(&positions).unwrap_or_default();
        Ok(Self { name, positions, normals, bounds })
    }

    /// Asset name (source mesh name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Local-space positions
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Local-space normals, if baked
    pub fn normals(&self) -> Option<&[Vec3]> {
        self.normals.as_deref()
    }

    /// Local-space bounds (zero box when empty)
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }
}
