//! Background asset loading
//!
//! Loads run on a tokio runtime owned by the loader; the frame loop drains
//! finished results with the non-blocking [`AssetLoader::poll_results`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::core::types::Result;
use crate::core::Error;
use super::asset::PointCloudAsset;
use super::disk_io::load_asset;

/// Result of an asset load operation
#[derive(Debug)]
pub enum LoadResult {
    /// Successfully loaded from disk
    Loaded(Arc<PointCloudAsset>),
    /// No asset file under that name
    NotFound(String),
    /// Error during loading
    Error(String, String),
}

impl LoadResult {
    /// Name of the requested asset
    pub fn name(&self) -> &str {
        match self {
            LoadResult::Loaded(asset) => asset.name(),
            LoadResult::NotFound(name) => name,
            LoadResult::Error(name, _) => name,
        }
    }
}

/// Concurrent asset loader with async I/O
pub struct AssetLoader {
    request_tx: mpsc::UnboundedSender<String>,
    result_rx: mpsc::UnboundedReceiver<LoadResult>,
    /// Names currently being loaded
    pending: HashSet<String>,
    base_dir: PathBuf,
    /// Kept alive for the worker task
    _runtime: Runtime,
}

impl AssetLoader {
    /// Create a new asset loader reading from `base_dir`
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<String>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<LoadResult>();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("vismem-asset-loader")
            .enable_all()
            .build()?;

        let worker_dir = base_dir.clone();
        runtime.spawn(async move {
            while let Some(name) = request_rx.recv().await {
                let result = Self::load_task(&worker_dir, name).await;
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            request_tx,
            result_rx,
            pending: HashSet::new(),
            base_dir,
            _runtime: runtime,
        })
    }

    async fn load_task(base_dir: &std::path::Path, name: String) -> LoadResult {
        match load_asset(base_dir, &name).await {
            Ok(Some(asset)) if asset.name() == name => LoadResult::Loaded(Arc::new(asset)),
            // File keyed by a sanitised name may hold the original spelling
            Ok(Some(asset)) => match PointCloudAsset::new(
                name.clone(),
                asset.positions().to_vec(),
                asset.normals().map(|n| n.to_vec()),
            ) {
                Ok(renamed) => LoadResult::Loaded(Arc::new(renamed)),
                Err(e) => LoadResult::Error(name, e.to_string()),
            },
            Ok(None) => LoadResult::NotFound(name),
            Err(e) => LoadResult::Error(name, e.to_string()),
        }
    }

    /// Request an asset to be loaded
    ///
    /// Returns `Ok(false)` if the asset is already pending.
    pub fn request(&mut self, name: &str) -> Result<bool> {
        if self.pending.contains(name) {
            return Ok(false);
        }

        self.request_tx
            .send(name.to_string())
            .map_err(|_| Error::Asset("asset loader worker stopped".to_string()))?;
        self.pending.insert(name.to_string());

        Ok(true)
    }

    /// Poll for completed load results (non-blocking)
    pub fn poll_results(&mut self) -> Vec<LoadResult> {
        let mut results = Vec::new();

        while let Ok(result) = self.result_rx.try_recv() {
            self.pending.remove(result.name());
            results.push(result);
        }

        results
    }

    /// Number of loads still in flight
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a load for `name` is in flight
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    /// Directory assets are read from
    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }
}
