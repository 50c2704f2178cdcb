//! Per-frame orchestration of occlusion testing and memory integration
//! across every registered point cloud.

use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

use crate::cloud::{AssetLoader, LoadResult, PointCloudAsset};
use crate::core::types::{Mat4, Result, Vec4};
use crate::core::Error;
use crate::math::Frustum;
use crate::render::buffer::{BufferStreamer, FrameUniform};
use crate::render::context::GpuDevice;
use crate::render::pipeline::VisibilityPipeline;
use super::config::{DispatchMode, OcclusionMode, VisibilityConfig};
use super::drift::Drift;
use super::frame::CameraFrame;
use super::memory::MemoryIntegrator;
use super::occlusion::{Observation, OcclusionStrategy, OcclusionTester, RayQuery};

/// Handle to a registered cloud
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloudId(u32);

impl fmt::Display for CloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cloud#{}", self.0)
    }
}

/// Lifecycle state of one cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudPhase {
    /// No buffers; initial state and the state after deactivation or a failed load
    Unloaded,
    /// Asset requested from an [`AssetLoader`]
    Loading,
    /// Buffers allocated and updated every tick
    Active,
    /// A required capability is missing; the cloud is skipped until reactivated
    Disabled(String),
}

/// Per-cloud statistics for one tick
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CloudFrameStats {
    pub id: Option<CloudId>,
    /// Points in the cloud
    pub total: usize,
    /// Points passing the frustum filter (CPU dispatch only)
    pub in_frustum: usize,
    /// Points that received an occlusion query (CPU dispatch only)
    pub tested: usize,
    /// Points observed this frame
    pub observed: usize,
    /// Mean memory after the update
    pub mean_memory: f32,
}

/// Result of one [`VisibilityEngine::tick`]
#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    /// One entry per cloud that was updated
    pub clouds: Vec<CloudFrameStats>,
    /// The depth fallback was applied because no snapshot was supplied
    pub degraded: bool,
}

impl FrameReport {
    pub fn stats(&self, id: CloudId) -> Option<&CloudFrameStats> {
        self.clouds.iter().find(|s| s.id == Some(id))
    }
}

#[derive(Clone, Copy, Default)]
struct BatchCounts {
    in_frustum: usize,
    tested: usize,
    observed: usize,
}

impl BatchCounts {
    fn record(&mut self, observation: Observation) {
        self.in_frustum += observation.in_frustum() as usize;
        self.tested += observation.tested() as usize;
        self.observed += (observation == Observation::Observed) as usize;
    }

    fn merge(self, other: Self) -> Self {
        Self {
            in_frustum: self.in_frustum + other.in_frustum,
            tested: self.tested + other.tested,
            observed: self.observed + other.observed,
        }
    }
}

struct CloudSlot {
    name: String,
    transform: Mat4,
    phase: CloudPhase,
    streamer: Option<BufferStreamer>,
}

struct GpuState {
    device: GpuDevice,
    pipeline: VisibilityPipeline,
}

/// Read-only inputs shared by every cloud in one tick
struct TickContext<'a> {
    frame: &'a CameraFrame,
    frustum: Frustum,
    tester: &'a OcclusionTester,
    integrator: MemoryIntegrator,
    drift: Drift,
    config: &'a VisibilityConfig,
    dt: f32,
    time: f64,
    hold: bool,
}

/// Orchestrates the visibility memory update for a set of point clouds.
///
/// The engine owns only the list of clouds; each active cloud's durable state
/// lives in its [`BufferStreamer`]. A failure in one cloud never stops the others.
pub struct VisibilityEngine {
    config: VisibilityConfig,
    ray_query: Option<Arc<dyn RayQuery>>,
    gpu: Option<GpuState>,
    clouds: Vec<CloudSlot>,
    /// Accumulated simulation time, drives drift
    time: f64,
}

impl VisibilityEngine {
    /// Create an engine; the configuration is validated here
    pub fn new(config: VisibilityConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Visibility engine: {:?} occlusion, {:?} dispatch, learn {}/s, forget {}/s",
            config.occlusion_mode, config.dispatch, config.learn_rate, config.forget_rate
        );
        Ok(Self {
            config,
            ray_query: None,
            gpu: None,
            clouds: Vec::new(),
            time: 0.0,
        })
    }

    /// Attach a GPU device; buffers are mirrored to it and GPU dispatch becomes available.
    ///
    /// Clouds that are already active get GPU buffers seeded from their current
    /// host state. A cloud whose buffers cannot be allocated is disabled.
    pub fn with_gpu(mut self, device: GpuDevice) -> Self {
        let pipeline = VisibilityPipeline::new(&device.device);
        for (index, slot) in self.clouds.iter_mut().enumerate() {
            let Some(streamer) = slot.streamer.as_mut() else {
                continue;
            };
            if let Err(e) = streamer.attach_gpu(&device, pipeline.point_bind_group_layout()) {
                log::error!("'{}' (cloud#{}) disabled: {}", slot.name, index, e);
                slot.streamer = None;
                slot.phase = CloudPhase::Disabled(e.to_string());
            }
        }
        self.gpu = Some(GpuState { device, pipeline });
        self
    }

    /// Scene used by the ray-query strategy
    pub fn with_ray_query(mut self, scene: Arc<dyn RayQuery>) -> Self {
        self.ray_query = Some(scene);
        self
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    pub fn gpu(&self) -> Option<&GpuDevice> {
        self.gpu.as_ref().map(|g| &g.device)
    }

    /// Seconds of simulation time ticked so far
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Register a cloud in the `Unloaded` state
    pub fn register(&mut self, name: impl Into<String>, transform: Mat4) -> CloudId {
        let id = CloudId(self.clouds.len() as u32);
        self.clouds.push(CloudSlot {
            name: name.into(),
            transform,
            phase: CloudPhase::Unloaded,
            streamer: None,
        });
        id
    }

    pub fn cloud_count(&self) -> usize {
        self.clouds.len()
    }

    fn slot(&self, id: CloudId) -> Result<&CloudSlot> {
        self.clouds
            .get(id.0 as usize)
            .ok_or_else(|| Error::Config(format!("unknown {}", id)))
    }

    fn slot_mut(&mut self, id: CloudId) -> Result<&mut CloudSlot> {
        self.clouds
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::Config(format!("unknown {}", id)))
    }

    /// Occlusion strategy for the current configuration
    fn strategy(&self) -> Result<OcclusionStrategy> {
        match self.config.occlusion_mode {
            OcclusionMode::DepthSnapshot => Ok(OcclusionStrategy::DepthSnapshot(self.config.depth_fallback)),
            OcclusionMode::RayQuery => self
                .ray_query
                .clone()
                .map(OcclusionStrategy::RayQuery)
                .ok_or_else(|| Error::Config("ray-query occlusion requested without a scene".to_string())),
        }
    }

    /// Check that the configured strategy and dispatch can actually run
    fn check_capability(&self) -> Result<()> {
        let strategy = self.strategy()?;
        if self.config.dispatch == DispatchMode::Gpu {
            if self.gpu.is_none() {
                return Err(Error::Config("GPU dispatch requested but no device is attached".to_string()));
            }
            if strategy.mode() == OcclusionMode::RayQuery {
                return Err(Error::Config("the GPU kernel only supports depth-snapshot occlusion".to_string()));
            }
        }
        Ok(())
    }

    /// Allocate buffers for `asset` and start updating the cloud.
    ///
    /// Any previous buffers are released first, so reactivating with a
    /// different point count always reallocates from scratch.
    pub fn activate(&mut self, id: CloudId, asset: Arc<PointCloudAsset>) -> Result<()> {
        let capability = self.check_capability();
        let initial_memory = self.config.initial_memory;
        let drift_enabled = Drift::from_config(&self.config).is_enabled();
        let gpu = self.gpu.as_ref();
        let slot = self
            .clouds
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::Config(format!("unknown {}", id)))?;

        slot.streamer = None;

        if let Err(e) = capability {
            log::error!("'{}' ({}) disabled: {}", slot.name, id, e);
            slot.phase = CloudPhase::Disabled(e.to_string());
            return Err(e);
        }

        let mut streamer = match BufferStreamer::new(asset, initial_memory, drift_enabled) {
            Ok(streamer) => streamer,
            Err(e) => {
                log::warn!("'{}' ({}) not activated: {}", slot.name, id, e);
                slot.phase = CloudPhase::Unloaded;
                return Err(e);
            }
        };

        if let Some(gpu) = gpu {
            if let Err(e) = streamer.attach_gpu(&gpu.device, gpu.pipeline.point_bind_group_layout()) {
                log::error!("'{}' ({}) disabled: {}", slot.name, id, e);
                slot.phase = CloudPhase::Disabled(e.to_string());
                return Err(e);
            }
        }

        log::info!("'{}' ({}) active with {} points", slot.name, id, streamer.len());
        slot.streamer = Some(streamer);
        slot.phase = CloudPhase::Active;
        Ok(())
    }

    /// Queue the cloud's asset on `loader`; it activates during a later [`Self::poll_loads`]
    pub fn begin_load(&mut self, id: CloudId, loader: &mut AssetLoader) -> Result<()> {
        let slot = self.slot_mut(id)?;
        loader.request(&slot.name)?;
        slot.streamer = None;
        slot.phase = CloudPhase::Loading;
        log::debug!("'{}' ({}) loading from {}", slot.name, id, loader.base_dir().display());
        Ok(())
    }

    /// Drain finished loads and move waiting clouds to `Active` or back to `Unloaded`.
    /// Returns the number of clouds activated.
    pub fn poll_loads(&mut self, loader: &mut AssetLoader) -> usize {
        let mut activated = 0;
        for result in loader.poll_results() {
            let waiting: Vec<CloudId> = self
                .clouds
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.phase == CloudPhase::Loading && slot.name == result.name())
                .map(|(index, _)| CloudId(index as u32))
                .collect();

            for id in waiting {
                match &result {
                    LoadResult::Loaded(asset) => {
                        if self.activate(id, asset.clone()).is_ok() {
                            activated += 1;
                        }
                    }
                    LoadResult::NotFound(name) => {
                        log::warn!("'{}' ({}) has no baked asset", name, id);
                        self.clouds[id.0 as usize].phase = CloudPhase::Unloaded;
                    }
                    LoadResult::Error(name, e) => {
                        log::warn!("'{}' ({}) failed to load: {}", name, id, e);
                        self.clouds[id.0 as usize].phase = CloudPhase::Unloaded;
                    }
                }
            }
        }
        activated
    }

    /// Release the cloud's buffers and return it to `Unloaded`
    pub fn deactivate(&mut self, id: CloudId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.streamer.take().is_some() {
            log::info!("'{}' ({}) deactivated", slot.name, id);
        }
        slot.phase = CloudPhase::Unloaded;
        Ok(())
    }

    pub fn set_transform(&mut self, id: CloudId, transform: Mat4) -> Result<()> {
        self.slot_mut(id)?.transform = transform;
        Ok(())
    }

    pub fn phase(&self, id: CloudId) -> Option<&CloudPhase> {
        self.clouds.get(id.0 as usize).map(|s| &s.phase)
    }

    pub fn name(&self, id: CloudId) -> Option<&str> {
        self.clouds.get(id.0 as usize).map(|s| s.name.as_str())
    }

    pub fn streamer(&self, id: CloudId) -> Option<&BufferStreamer> {
        self.clouds.get(id.0 as usize).and_then(|s| s.streamer.as_ref())
    }

    pub fn memory(&self, id: CloudId) -> Option<&[f32]> {
        self.streamer(id).map(|s| s.memory())
    }

    pub fn visibility(&self, id: CloudId) -> Option<&[f32]> {
        self.streamer(id).map(|s| s.visibility())
    }

    pub fn final_positions(&self, id: CloudId) -> Option<&[Vec4]> {
        self.streamer(id).and_then(|s| s.final_positions())
    }

    /// Diagnostic read of the first `n` memory values, after all submitted work
    pub fn read_memory_sample(&self, id: CloudId, n: usize) -> Result<Vec<f32>> {
        let streamer = self
            .slot(id)?
            .streamer
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{} is not active", id)))?;
        streamer.read_memory_sample(self.gpu(), n)
    }

    /// Advance every active cloud by `dt` seconds against `frame`
    pub fn tick(&mut self, frame: &CameraFrame, dt: f32) -> FrameReport {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        self.time += dt as f64;

        let mut report = FrameReport::default();

        let strategy = match self.strategy() {
            Ok(strategy) => strategy,
            Err(e) => {
                self.disable_active(&e);
                return report;
            }
        };

        let tester = OcclusionTester::new(strategy, &self.config);
        report.degraded = tester.is_degraded(frame) && self.clouds.iter().any(|s| s.phase == CloudPhase::Active);
        if report.degraded {
            log::debug!("No depth snapshot this frame, applying {:?}", self.config.depth_fallback);
        }

        if self.config.dispatch == DispatchMode::Gpu {
            if let Some(gpu) = self.gpu.as_mut() {
                gpu.pipeline.upload_depth(&gpu.device, frame.depth.as_ref());
            }
        }

        let ctx = TickContext {
            frame,
            frustum: Frustum::from_view_projection(&frame.view_projection),
            tester: &tester,
            integrator: MemoryIntegrator::from_config(&self.config),
            drift: Drift::from_config(&self.config),
            config: &self.config,
            dt,
            time: self.time,
            hold: tester.holds_memory(frame),
        };
        let gpu = self.gpu.as_ref();

        for (index, slot) in self.clouds.iter_mut().enumerate() {
            if slot.phase != CloudPhase::Active {
                continue;
            }
            let Some(streamer) = slot.streamer.as_mut() else {
                continue;
            };
            let id = CloudId(index as u32);

            let result = match ctx.config.dispatch {
                DispatchMode::Cpu => Ok(update_cpu(streamer, &slot.transform, &ctx, gpu)),
                DispatchMode::Gpu => update_gpu(streamer, &slot.transform, &ctx, gpu),
            };

            match result {
                Ok(mut stats) => {
                    stats.id = Some(id);
                    report.clouds.push(stats);
                }
                Err(e) => {
                    log::error!("'{}' ({}) disabled: {}", slot.name, id, e);
                    slot.streamer = None;
                    slot.phase = CloudPhase::Disabled(e.to_string());
                }
            }
        }

        report
    }

    fn disable_active(&mut self, error: &Error) {
        for (index, slot) in self.clouds.iter_mut().enumerate() {
            if slot.phase == CloudPhase::Active {
                log::error!("'{}' (cloud#{}) disabled: {}", slot.name, index, error);
                slot.streamer = None;
                slot.phase = CloudPhase::Disabled(error.to_string());
            }
        }
    }
}

/// Host update: parallel occlusion pass, join, then parallel integration
fn update_cpu(
    streamer: &mut BufferStreamer,
    transform: &Mat4,
    ctx: &TickContext<'_>,
    gpu: Option<&GpuState>,
) -> CloudFrameStats {
    let asset = streamer.asset().clone();
    let group = ctx.config.batch_group_size;

    let world_bounds = asset.bounds().transformed(transform);
    let in_view = ctx.frustum.intersects_aabb(&world_bounds);
    let in_range = world_bounds.distance_to_point(ctx.frame.position) <= ctx.tester.cull_radius();

    let (memory, visibility, final_positions) = streamer.state_mut();

    let counts = if in_view && in_range {
        visibility
            .par_chunks_mut(group)
            .zip(asset.positions().par_chunks(group))
            .map(|(signals, points)| {
                let mut counts = BatchCounts::default();
                for (signal, &local) in signals.iter_mut().zip(points) {
                    let observation = ctx.tester.test(ctx.frame, transform.transform_point3(local));
                    counts.record(observation);
                    *signal = observation.signal();
                }
                counts
            })
            .reduce(BatchCounts::default, BatchCounts::merge)
    } else if in_view {
        // Whole cloud beyond the cull radius: every point is unobserved, only the frustum count remains
        visibility.fill(0.0);
        let in_frustum = asset
            .positions()
            .par_chunks(group)
            .map(|points| {
                points
                    .iter()
                    .filter(|&&local| {
                        ctx.frame
                            .project(transform.transform_point3(local))
                            .is_some_and(|p| p.in_frustum())
                    })
                    .count()
            })
            .sum();
        BatchCounts { in_frustum, ..Default::default() }
    } else {
        visibility.fill(0.0);
        BatchCounts::default()
    };

    if !ctx.hold {
        ctx.integrator.integrate(memory, visibility, ctx.dt, group);
    }
    if let Some(final_positions) = final_positions {
        ctx.drift.apply(asset.positions(), final_positions, ctx.time, group);
    }

    if let Some(gpu) = gpu {
        streamer.upload(&gpu.device.queue);
    }

    CloudFrameStats {
        id: None,
        total: asset.len(),
        in_frustum: counts.in_frustum,
        tested: counts.tested,
        observed: counts.observed,
        mean_memory: streamer.mean_memory(),
    }
}

/// Kernel update followed by a blocking readback into the host mirror
fn update_gpu(
    streamer: &mut BufferStreamer,
    transform: &Mat4,
    ctx: &TickContext<'_>,
    gpu: Option<&GpuState>,
) -> Result<CloudFrameStats> {
    let gpu = gpu.ok_or_else(|| Error::Config("GPU dispatch requested but no device is attached".to_string()))?;
    let buffers = streamer
        .gpu_buffers()
        .ok_or_else(|| Error::Gpu("cloud has no GPU buffers".to_string()))?;

    let uniform = FrameUniform::new(ctx.frame, transform, ctx.config, ctx.dt, ctx.time, buffers.len());
    gpu.pipeline.run(&gpu.device, buffers, &uniform)?;
    streamer.sync_from_gpu(&gpu.device.device)?;

    Ok(CloudFrameStats {
        id: None,
        total: streamer.len(),
        in_frustum: 0,
        tested: 0,
        observed: streamer.visibility().iter().filter(|&&v| v > 0.5).count(),
        mean_memory: streamer.mean_memory(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::disk_io::{asset_path, compress_asset};
    use crate::core::camera::Camera;
    use crate::core::types::Vec3;
    use crate::math::Aabb;
    use crate::visibility::{DepthFallback, DepthSnapshot, OccluderSet};
    use std::time::{Duration, Instant};

    /// `n` points spread over the z = 0 plane inside [-1, 1]^2
    fn plane_asset(name: &str, n: usize) -> Arc<PointCloudAsset> {
        let side = (n as f32).sqrt().ceil() as usize;
        let positions = (0..n)
            .map(|i| {
                let (x, y) = ((i % side) as f32, (i / side) as f32);
                Vec3::new(x / side as f32 * 2.0 - 1.0, y / side as f32 * 2.0 - 1.0, 0.0)
            })
            .collect();
        Arc::new(PointCloudAsset::new(name, positions, None).unwrap())
    }

    fn camera() -> Camera {
        Camera::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y)
    }

    /// Frame whose depth snapshot has nothing in front of the plane
    fn open_frame() -> CameraFrame {
        camera().frame(32, 32, Some(DepthSnapshot::uniform(32, 32, 1.0).unwrap()))
    }

    /// Frame whose depth snapshot has a wall 5 units in front of the plane
    fn blocked_frame() -> CameraFrame {
        let wall = camera().frame(32, 32, None).project(Vec3::new(0.0, 0.0, 5.0)).unwrap().ndc.z;
        camera().frame(32, 32, Some(DepthSnapshot::uniform(32, 32, wall).unwrap()))
    }

    fn engine(config: VisibilityConfig) -> VisibilityEngine {
        VisibilityEngine::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = VisibilityConfig {
            batch_group_size: 0,
            ..Default::default()
        };
        assert!(matches!(VisibilityEngine::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_observed_points_learn() {
        let mut engine = engine(VisibilityConfig::default());
        let id = engine.register("hall", Mat4::IDENTITY);
        assert_eq!(engine.phase(id), Some(&CloudPhase::Unloaded));

        engine.activate(id, plane_asset("hall", 100)).unwrap();
        assert_eq!(engine.phase(id), Some(&CloudPhase::Active));

        let frame = open_frame();
        let mut report = FrameReport::default();
        for _ in 0..300 {
            report = engine.tick(&frame, 1.0 / 60.0);
        }

        let stats = report.stats(id).unwrap();
        assert_eq!(stats.total, 100);
        assert_eq!(stats.in_frustum, 100);
        assert_eq!(stats.tested, 100);
        assert_eq!(stats.observed, 100);
        assert!(!report.degraded);

        for &m in engine.memory(id).unwrap() {
            assert!((m - 0.865).abs() < 0.005, "memory {}", m);
        }
        assert!(engine.visibility(id).unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_occluded_points_forget() {
        let config = VisibilityConfig {
            initial_memory: 1.0,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 64)).unwrap();

        let frame = blocked_frame();
        let mut report = FrameReport::default();
        for _ in 0..300 {
            report = engine.tick(&frame, 1.0 / 60.0);
        }

        let stats = report.stats(id).unwrap();
        assert_eq!(stats.observed, 0);
        assert_eq!(stats.tested, 64);
        // e^-1 after 5 s at forget 0.2
        assert!((stats.mean_memory - 0.368).abs() < 0.005, "mean {}", stats.mean_memory);
    }

    #[test]
    fn test_zero_dt_tick_keeps_memory() {
        let config = VisibilityConfig {
            initial_memory: 0.5,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 16)).unwrap();

        engine.tick(&open_frame(), 0.0);
        assert!(engine.memory(id).unwrap().iter().all(|&m| m == 0.5));
        // Visibility is still recomputed
        assert!(engine.visibility(id).unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_cloud_outside_frustum_skips_tests() {
        let mut engine = engine(VisibilityConfig {
            initial_memory: 1.0,
            ..Default::default()
        });
        // Behind the camera
        let id = engine.register("behind", Mat4::from_translation(Vec3::new(0.0, 0.0, 30.0)));
        engine.activate(id, plane_asset("behind", 50)).unwrap();

        let report = engine.tick(&open_frame(), 0.5);
        let stats = report.stats(id).unwrap();
        assert_eq!((stats.in_frustum, stats.tested, stats.observed), (0, 0, 0));
        assert!(engine.memory(id).unwrap().iter().all(|&m| m < 1.0));
    }

    #[test]
    fn test_set_transform_moves_cloud() {
        let mut engine = engine(VisibilityConfig::default());
        let id = engine.register("mover", Mat4::from_translation(Vec3::new(0.0, 0.0, 30.0)));
        engine.activate(id, plane_asset("mover", 16)).unwrap();

        assert_eq!(engine.tick(&open_frame(), 0.1).stats(id).unwrap().observed, 0);
        engine.set_transform(id, Mat4::IDENTITY).unwrap();
        assert_eq!(engine.tick(&open_frame(), 0.1).stats(id).unwrap().observed, 16);
    }

    #[test]
    fn test_reload_with_fewer_points() {
        let mut engine = engine(VisibilityConfig::default());
        let id = engine.register("hall", Mat4::IDENTITY);

        engine.activate(id, plane_asset("hall", 1000)).unwrap();
        for _ in 0..30 {
            engine.tick(&open_frame(), 0.1);
        }
        assert!(engine.memory(id).unwrap().iter().all(|&m| m > 0.5));

        engine.activate(id, plane_asset("hall", 500)).unwrap();
        let streamer = engine.streamer(id).unwrap();
        assert_eq!(streamer.len(), 500);
        assert_eq!(streamer.memory().len(), 500);
        assert_eq!(streamer.visibility().len(), 500);
        assert_eq!(streamer.asset().len(), 500);
        assert!(streamer.memory().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_empty_asset_keeps_cloud_unloaded() {
        let mut engine = engine(VisibilityConfig::default());
        let empty = engine.register("empty", Mat4::IDENTITY);
        let good = engine.register("good", Mat4::IDENTITY);

        let asset = Arc::new(PointCloudAsset::new("empty", Vec::new(), None).unwrap());
        assert!(matches!(engine.activate(empty, asset), Err(Error::Asset(_))));
        engine.activate(good, plane_asset("good", 9)).unwrap();

        let report = engine.tick(&open_frame(), 0.1);
        assert_eq!(engine.phase(empty), Some(&CloudPhase::Unloaded));
        assert!(engine.memory(empty).is_none());
        assert_eq!(report.clouds.len(), 1);
        assert_eq!(report.stats(good).unwrap().observed, 9);
    }

    #[test]
    fn test_missing_capability_disables() {
        let config = VisibilityConfig {
            dispatch: DispatchMode::Gpu,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);

        assert!(matches!(engine.activate(id, plane_asset("hall", 4)), Err(Error::Config(_))));
        assert!(matches!(engine.phase(id), Some(CloudPhase::Disabled(_))));
        assert!(engine.tick(&open_frame(), 0.1).clouds.is_empty());

        engine.deactivate(id).unwrap();
        assert_eq!(engine.phase(id), Some(&CloudPhase::Unloaded));
    }

    #[test]
    fn test_ray_query_without_scene_disables() {
        let config = VisibilityConfig {
            occlusion_mode: OcclusionMode::RayQuery,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        assert!(engine.activate(id, plane_asset("hall", 4)).is_err());
        assert!(matches!(engine.phase(id), Some(CloudPhase::Disabled(_))));
    }

    #[test]
    fn test_ray_query_mode() {
        let mut scene = OccluderSet::new();
        // Covers the left half of the plane as seen from the camera
        scene.add_box(Aabb::new(Vec3::new(-5.0, -5.0, 4.0), Vec3::new(-0.01, 5.0, 5.0)));

        let config = VisibilityConfig {
            occlusion_mode: OcclusionMode::RayQuery,
            ..Default::default()
        };
        let mut engine = engine(config).with_ray_query(Arc::new(scene));
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 100)).unwrap();

        // No depth snapshot needed in ray-query mode
        let report = engine.tick(&camera().frame(32, 32, None), 0.5);
        assert!(!report.degraded);

        let stats = report.stats(id).unwrap();
        assert_eq!(stats.tested, 100);
        assert_eq!(stats.observed, 50);

        let asset = engine.streamer(id).unwrap().asset().clone();
        for (p, &v) in asset.positions().iter().zip(engine.visibility(id).unwrap()) {
            assert_eq!(v == 1.0, p.x >= 0.0, "point {:?}", p);
        }
    }

    #[test]
    fn test_missing_depth_holds_memory() {
        let config = VisibilityConfig {
            initial_memory: 0.5,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 25)).unwrap();

        let report = engine.tick(&camera().frame(32, 32, None), 0.5);
        assert!(report.degraded);
        assert_eq!(report.stats(id).unwrap().tested, 0);
        assert!(engine.memory(id).unwrap().iter().all(|&m| m == 0.5));
    }

    #[test]
    fn test_missing_depth_assume_visible() {
        let config = VisibilityConfig {
            depth_fallback: DepthFallback::AssumeVisible,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 25)).unwrap();

        let report = engine.tick(&camera().frame(32, 32, None), 0.5);
        assert!(report.degraded);
        assert_eq!(report.stats(id).unwrap().observed, 25);
        assert!(engine.memory(id).unwrap().iter().all(|&m| m > 0.0));
    }

    #[test]
    fn test_drift_buffer() {
        let config = VisibilityConfig {
            drift_amplitude: 0.1,
            ..Default::default()
        };
        let mut engine = engine(config);
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 36)).unwrap();
        engine.tick(&open_frame(), 0.25);

        let asset = engine.streamer(id).unwrap().asset().clone();
        let finals = engine.final_positions(id).unwrap();
        assert_eq!(finals.len(), 36);
        for (p, f) in asset.positions().iter().zip(finals) {
            assert!(p.distance(f.truncate()) <= 0.1 * (1.0 + 1e-5));
        }

        let mut plain = self::engine(VisibilityConfig::default());
        let other = plain.register("hall", Mat4::IDENTITY);
        plain.activate(other, plane_asset("hall", 36)).unwrap();
        assert!(plain.final_positions(other).is_none());
    }

    #[test]
    fn test_unknown_id() {
        let mut engine = engine(VisibilityConfig::default());
        let mut other = self::engine(VisibilityConfig::default());
        other.register("a", Mat4::IDENTITY);
        let foreign = other.register("b", Mat4::IDENTITY);

        assert!(engine.phase(foreign).is_none());
        assert!(engine.deactivate(foreign).is_err());
        assert!(engine.read_memory_sample(foreign, 5).is_err());
    }

    #[test]
    fn test_read_memory_sample() {
        let mut engine = engine(VisibilityConfig::default());
        let id = engine.register("hall", Mat4::IDENTITY);
        assert!(engine.read_memory_sample(id, 5).is_err());

        engine.activate(id, plane_asset("hall", 10)).unwrap();
        engine.tick(&open_frame(), 1.0);
        let sample = engine.read_memory_sample(id, 5).unwrap();
        assert_eq!(sample.len(), 5);
        assert!(sample.iter().all(|&m| (m - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_async_load_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let asset = plane_asset("Town Hall", 49);
        std::fs::write(asset_path(dir.path(), "Town Hall"), compress_asset(&asset).unwrap()).unwrap();

        let mut loader = AssetLoader::new(dir.path().to_path_buf()).unwrap();
        let mut engine = engine(VisibilityConfig::default());
        let hall = engine.register("Town Hall", Mat4::IDENTITY);
        let ghost = engine.register("ghost", Mat4::IDENTITY);

        engine.begin_load(hall, &mut loader).unwrap();
        engine.begin_load(ghost, &mut loader).unwrap();
        assert_eq!(engine.phase(hall), Some(&CloudPhase::Loading));

        let deadline = Instant::now() + Duration::from_secs(5);
        while loader.pending_count() > 0 && Instant::now() < deadline {
            engine.poll_loads(&mut loader);
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.poll_loads(&mut loader);

        assert_eq!(engine.phase(hall), Some(&CloudPhase::Active));
        assert_eq!(engine.memory(hall).unwrap().len(), 49);
        assert_eq!(engine.phase(ghost), Some(&CloudPhase::Unloaded));
    }

    #[test]
    fn test_cloud_beyond_cull_radius_counts_frustum() {
        let mut engine = engine(VisibilityConfig {
            cull_radius: 5.0,
            initial_memory: 1.0,
            ..Default::default()
        });
        let id = engine.register("far", Mat4::IDENTITY);
        engine.activate(id, plane_asset("far", 100)).unwrap();

        let report = engine.tick(&open_frame(), 0.5);
        let stats = report.stats(id).unwrap();
        assert_eq!((stats.in_frustum, stats.tested, stats.observed), (100, 0, 0));
        assert!(engine.visibility(id).unwrap().iter().all(|&v| v == 0.0));
        assert!(engine.memory(id).unwrap().iter().all(|&m| m < 1.0));
    }

    fn assert_close(cpu: &[f32], gpu: &[f32], what: &str) {
        assert_eq!(cpu.len(), gpu.len(), "{}", what);
        for (i, (a, b)) in cpu.iter().zip(gpu).enumerate() {
            assert!((a - b).abs() <= 1e-5, "{} [{}]: cpu {} gpu {}", what, i, a, b);
        }
    }

    /// Tick identical clouds under CPU and GPU dispatch and compare every buffer after each frame
    fn check_dispatch_parity(fallback: DepthFallback) {
        let Some(gpu) = GpuDevice::for_tests() else {
            return;
        };
        let config = VisibilityConfig {
            initial_memory: 0.5,
            drift_amplitude: 0.1,
            drift_frequency: 2.0,
            depth_fallback: fallback,
            ..Default::default()
        };
        let mut cpu = engine(config.clone());
        let mut gpu_engine = engine(VisibilityConfig {
            dispatch: DispatchMode::Gpu,
            ..config
        })
        .with_gpu(gpu);

        let transforms = [
            Mat4::IDENTITY,
            // Straddles the right edge of the view (half-width ~10.26 at this depth)
            Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
            // Behind the camera
            Mat4::from_translation(Vec3::new(0.0, 0.0, 30.0)),
        ];
        let mut ids = Vec::new();
        for (k, transform) in transforms.iter().enumerate() {
            let name = format!("block{}", k);
            let asset = plane_asset(&name, 400);
            let id = cpu.register(name.as_str(), *transform);
            assert_eq!(gpu_engine.register(name.as_str(), *transform), id);
            cpu.activate(id, asset.clone()).unwrap();
            gpu_engine.activate(id, asset).unwrap();
            ids.push(id);
        }

        let no_depth = camera().frame(32, 32, None);
        let frames = [open_frame(), blocked_frame(), no_depth.clone(), open_frame(), no_depth, blocked_frame()];
        for (step, frame) in frames.iter().enumerate() {
            let cpu_report = cpu.tick(frame, 1.0 / 30.0);
            let gpu_report = gpu_engine.tick(frame, 1.0 / 30.0);
            assert_eq!(cpu_report.degraded, gpu_report.degraded);

            for &id in &ids {
                let what = format!("frame {} {}", step, id);
                assert_eq!(gpu_engine.phase(id), Some(&CloudPhase::Active), "{}", what);
                assert_close(cpu.memory(id).unwrap(), gpu_engine.memory(id).unwrap(), &format!("{} memory", what));
                assert_close(
                    cpu.visibility(id).unwrap(),
                    gpu_engine.visibility(id).unwrap(),
                    &format!("{} visibility", what),
                );
                assert_eq!(
                    cpu_report.stats(id).unwrap().observed,
                    gpu_report.stats(id).unwrap().observed,
                    "{}",
                    what
                );

                let cpu_finals = cpu.final_positions(id).unwrap();
                let gpu_finals = gpu_engine.final_positions(id).unwrap();
                for (i, (a, b)) in cpu_finals.iter().zip(gpu_finals).enumerate() {
                    // WGSL sin is not correctly rounded
                    assert!(a.distance(*b) < 1e-4, "{} final [{}]: {:?} vs {:?}", what, i, a, b);
                }
            }
        }

        // The straddling cloud really is split by the frustum
        let stats = cpu.tick(&open_frame(), 0.0).stats(ids[1]).copied().unwrap();
        assert!(stats.in_frustum > 0 && stats.in_frustum < 400, "in frustum {}", stats.in_frustum);
    }

    #[test]
    fn test_gpu_matches_cpu_holding_memory() {
        check_dispatch_parity(DepthFallback::HoldMemory);
    }

    #[test]
    fn test_gpu_matches_cpu_assuming_visible() {
        check_dispatch_parity(DepthFallback::AssumeVisible);
    }

    #[test]
    fn test_gpu_reload_with_fewer_points() {
        let Some(gpu) = GpuDevice::for_tests() else {
            return;
        };
        let mut engine = engine(VisibilityConfig {
            dispatch: DispatchMode::Gpu,
            ..Default::default()
        })
        .with_gpu(gpu);
        let id = engine.register("hall", Mat4::IDENTITY);

        engine.activate(id, plane_asset("hall", 1000)).unwrap();
        for _ in 0..30 {
            engine.tick(&open_frame(), 0.1);
        }
        assert!(engine.memory(id).unwrap().iter().all(|&m| m > 0.5));

        engine.activate(id, plane_asset("hall", 500)).unwrap();
        let streamer = engine.streamer(id).unwrap();
        assert_eq!(streamer.gpu_buffers().unwrap().len(), 500);
        assert_eq!(streamer.memory().len(), 500);

        let report = engine.tick(&open_frame(), 0.1);
        let stats = report.stats(id).unwrap();
        assert_eq!((stats.total, stats.observed), (500, 500));
        // Fresh memory: one 0.1 s step from 0 at learn rate 0.4
        let sample = engine.read_memory_sample(id, 8).unwrap();
        assert!(sample.iter().all(|&m| (m - 0.04).abs() < 1e-5), "{:?}", sample);
    }

    #[test]
    fn test_gpu_attached_after_activation() {
        let Some(gpu) = GpuDevice::for_tests() else {
            return;
        };
        let mut engine = engine(VisibilityConfig::default());
        let id = engine.register("hall", Mat4::IDENTITY);
        engine.activate(id, plane_asset("hall", 64)).unwrap();
        engine.tick(&open_frame(), 1.0);
        assert!(engine.streamer(id).unwrap().gpu_buffers().is_none());

        let mut engine = engine.with_gpu(gpu);
        assert_eq!(engine.phase(id), Some(&CloudPhase::Active));
        assert!(engine.streamer(id).unwrap().gpu_buffers().is_some());

        // GPU copy is seeded from the host state
        let sample = engine.read_memory_sample(id, 4).unwrap();
        assert!(sample.iter().all(|&m| (m - 0.4).abs() < 1e-6), "{:?}", sample);

        // CPU dispatch keeps the copy current: 0.4 + 0.4 * 0.6
        engine.tick(&open_frame(), 1.0);
        let sample = engine.read_memory_sample(id, 4).unwrap();
        assert!(sample.iter().all(|&m| (m - 0.64).abs() < 1e-6), "{:?}", sample);
    }
}
