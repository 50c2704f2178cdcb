//! Baked point clouds: the immutable asset, the offline baker, and
//! asset persistence / background loading.

pub mod asset;
pub mod bake;
pub mod disk_io;
pub mod loader;

pub use asset::PointCloudAsset;
pub use bake::{bake, BakeSettings, MeshData, DEFAULT_DENSITY};
pub use disk_io::{asset_path, asset_exists, load_asset, save_asset, ASSET_EXTENSION};
pub use loader::{AssetLoader, LoadResult};
