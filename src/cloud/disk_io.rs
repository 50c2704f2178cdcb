//! Point cloud asset serialization and disk I/O
//!
//! Assets are rkyv archives compressed with LZ4, stored as
//! `<dir>/<name>.vpc` keyed by the source mesh name.

use rkyv::{Archive, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::types::{Result, Vec3};
use crate::core::Error;
use super::asset::PointCloudAsset;

/// File extension for baked point cloud assets
pub const ASSET_EXTENSION: &str = "vpc";

/// Serializable asset payload
#[derive(Archive, Deserialize, Serialize)]
struct AssetData {
    name: String,
    positions: Vec<[f32; 3]>,
    normals: Option<Vec<[f32; 3]>>,
}

/// Serialize an asset to bytes (uncompressed)
pub fn serialize_asset(asset: &PointCloudAsset) -> Result<Vec<u8>> {
    let data = AssetData {
        name: asset.name().to_string(),
        positions: asset.positions().iter().map(|p| p.to_array()).collect(),
        normals: asset
            .normals()
            .map(|n| n.iter().map(|v| v.to_array()).collect()),
    };

    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
        .map_err(|e| Error::Asset(e.to_string()))?;

    Ok(bytes.to_vec())
}

/// Deserialize an asset from bytes (uncompressed)
pub fn deserialize_asset(data: &[u8]) -> Result<PointCloudAsset> {
    // Archived data must be read from an aligned buffer
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);

    let archived = rkyv::access::<ArchivedAssetData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Asset(format!("invalid asset archive: {}", e)))?;

    let data: AssetData = rkyv::deserialize::<AssetData, rkyv::rancor::Error>(archived)
        .map_err(|e| Error::Asset(format!("invalid asset archive: {}", e)))?;

    let positions = data.positions.into_iter().map(Vec3::from_array).collect();
    let normals = data
        .normals
        .map(|n| n.into_iter().map(Vec3::from_array).collect());

    PointCloudAsset::new(data.name, positions, normals)
}

/// Serialize and compress an asset using LZ4
pub fn compress_asset(asset: &PointCloudAsset) -> Result<Vec<u8>> {
    let serialized = serialize_asset(asset)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress and deserialize an asset
pub fn decompress_asset(data: &[u8]) -> Result<PointCloudAsset> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Asset(format!("LZ4 decompression failed: {}", e)))?;
    deserialize_asset(&decompressed)
}

/// Get the file path for a named asset (spaces become underscores)
pub fn asset_path(base_dir: &Path, name: &str) -> PathBuf {
    let file_name = name.trim().replace(' ', "_");
    base_dir.join(format!("{}.{}", file_name, ASSET_EXTENSION))
}

/// Save an asset to disk (compressed), returning the written path
pub async fn save_asset(base_dir: &Path, asset: &PointCloudAsset) -> Result<PathBuf> {
    let path = asset_path(base_dir, asset.name());

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let compressed = compress_asset(asset)?;
    tokio::fs::write(&path, compressed).await?;

    Ok(path)
}

/// Load an asset from disk (if it exists)
pub async fn load_asset(base_dir: &Path, name: &str) -> Result<Option<PointCloudAsset>> {
    let path = asset_path(base_dir, name);

    if !path.exists() {
        return Ok(None);
    }

    let compressed = tokio::fs::read(&path).await?;
    let asset = decompress_asset(&compressed)?;

    Ok(Some(asset))
}

/// Check if an asset exists on disk
pub fn asset_exists(base_dir: &Path, name: &str) -> bool {
    asset_path(base_dir, name).exists()
}
