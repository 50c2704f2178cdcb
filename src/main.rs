//! Headless visibility memory driver.
//!
//! Loads (or bakes) a building point cloud, orbits a camera around it at a
//! fixed timestep and logs how the per-point memory evolves.
//!
//! Usage: cargo run --release --bin vismem -- [OPTIONS]
//!
//! Options:
//!   --asset <NAME>    Asset name (default: "demo_building")
//!   --dir <DIR>       Asset directory (default: assets/point_clouds)
//!   --frames <N>      Frames to simulate (default: 600)
//!   --dt <SECONDS>    Fixed timestep (default: 1/60)
//!   --config <FILE>   Visibility config JSON
//!   --gpu             Run the per-point update on the GPU

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vismem::cloud::bake::box_mesh;
use vismem::cloud::disk_io::{asset_path, compress_asset};
use vismem::cloud::{asset_exists, bake, AssetLoader, BakeSettings};
use vismem::core::camera::Camera;
use vismem::core::logging;
use vismem::core::time::FrameTimer;
use vismem::core::types::{Mat4, Vec3};
use vismem::core::Error;
use vismem::math::Aabb;
use vismem::render::GpuDevice;
use vismem::visibility::{
    CloudPhase, DepthSnapshot, DispatchMode, OccluderSet, OcclusionMode, VisibilityConfig, VisibilityEngine,
};

/// Depth snapshot resolution traced each frame
const SNAPSHOT_WIDTH: u32 = 160;
const SNAPSHOT_HEIGHT: u32 = 90;

/// Demo building footprint when no asset exists yet
const DEMO_MIN: Vec3 = Vec3::new(-4.0, 0.0, -4.0);
const DEMO_MAX: Vec3 = Vec3::new(4.0, 12.0, 4.0);
const DEMO_DENSITY: f32 = 20.0;

const ORBIT_RADIUS: f32 = 25.0;
const ORBIT_HEIGHT: f32 = 6.0;
/// Radians per second
const ORBIT_SPEED: f32 = 0.3;

fn main() {
    logging::init();
    log::info!("vismem starting...");

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<(), Error> {
    let asset_name = parse_str_arg(args, "--asset").unwrap_or_else(|| "demo_building".to_string());
    let dir = parse_str_arg(args, "--dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("assets/point_clouds"));
    let frames = parse_usize_arg(args, "--frames").unwrap_or(600);
    let dt = parse_f32_arg(args, "--dt").unwrap_or(1.0 / 60.0);
    let use_gpu = args.iter().any(|a| a == "--gpu");

    let mut config = match parse_str_arg(args, "--config") {
        Some(path) => VisibilityConfig::from_json_file(&PathBuf::from(path))?,
        None => VisibilityConfig::default(),
    };
    if use_gpu {
        config.dispatch = DispatchMode::Gpu;
    }
    if !(dt.is_finite() && dt > 0.0) {
        return Err(Error::Config(format!("--dt must be positive, got {}", dt)));
    }

    if !asset_exists(&dir, &asset_name) {
        log::info!("No asset '{}' in {}, baking the demo building", asset_name, dir.display());
        let mesh = box_mesh(&asset_name, DEMO_MIN, DEMO_MAX);
        let asset = bake(&mesh, &BakeSettings { density: DEMO_DENSITY, seed: 7 })?;
        std::fs::create_dir_all(&dir)?;
        std::fs::write(asset_path(&dir, &asset_name), compress_asset(&asset)?)?;
    }

    // Occluders: the building itself plus a freestanding wall the orbit passes behind
    let mut scene = OccluderSet::new();
    scene.add_box(Aabb::new(DEMO_MIN, DEMO_MAX));
    scene.add_box(Aabb::new(Vec3::new(-10.0, 0.0, 10.0), Vec3::new(10.0, 8.0, 11.0)));
    let scene = Arc::new(scene);

    let occlusion_mode = config.occlusion_mode;
    let mut engine = VisibilityEngine::new(config)?.with_ray_query(scene.clone());
    if use_gpu {
        match GpuDevice::new_headless() {
            Ok(device) => engine = engine.with_gpu(device),
            Err(e) => log::error!("GPU unavailable: {}", e),
        }
    }

    let mut loader = AssetLoader::new(dir.clone())?;
    let id = engine.register(asset_name.as_str(), Mat4::IDENTITY);
    engine.begin_load(id, &mut loader)?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.phase(id) == Some(&CloudPhase::Loading) && Instant::now() < deadline {
        engine.poll_loads(&mut loader);
        std::thread::sleep(Duration::from_millis(5));
    }
    match engine.phase(id) {
        Some(CloudPhase::Active) => {}
        Some(CloudPhase::Disabled(reason)) => {
            return Err(Error::Config(format!("'{}' disabled: {}", asset_name, reason)));
        }
        other => {
            return Err(Error::Asset(format!("'{}' did not load (phase {:?})", asset_name, other)));
        }
    }

    let center = Aabb::new(DEMO_MIN, DEMO_MAX).center();
    let mut camera = Camera::new(Vec3::ZERO, 60.0, 16.0 / 9.0);
    camera.set_aspect(SNAPSHOT_WIDTH as f32, SNAPSHOT_HEIGHT as f32);

    let mut timer = FrameTimer::new();
    let step = Duration::from_secs_f32(dt);
    let frames_per_second = (1.0 / dt).round().max(1.0) as u64;
    let start = Instant::now();

    for _ in 0..frames {
        timer.advance(step);

        let angle = timer.elapsed_secs() * ORBIT_SPEED;
        camera.position = Vec3::new(angle.cos() * ORBIT_RADIUS, ORBIT_HEIGHT, angle.sin() * ORBIT_RADIUS);
        camera.point_at(center, Vec3::Y);

        let depth = match occlusion_mode {
            OcclusionMode::DepthSnapshot => Some(DepthSnapshot::trace(
                camera.view_projection(),
                SNAPSHOT_WIDTH,
                SNAPSHOT_HEIGHT,
                scene.as_ref(),
            )?),
            OcclusionMode::RayQuery => None,
        };
        let frame = camera.frame(SNAPSHOT_WIDTH, SNAPSHOT_HEIGHT, depth);
        let report = engine.tick(&frame, timer.delta_secs());

        if timer.frame_count() % frames_per_second == 0 {
            match report.stats(id) {
                Some(stats) => log::info!(
                    "t={:5.1}s observed {:5}/{} (tested {:5}) mean memory {:.3}",
                    timer.elapsed_secs(),
                    stats.observed,
                    stats.total,
                    stats.tested,
                    stats.mean_memory
                ),
                None => log::warn!("t={:5.1}s '{}' not updated", timer.elapsed_secs(), asset_name),
            }
            if let Ok(sample) = engine.read_memory_sample(id, 5) {
                log::debug!("memory[0..5] = {:?}", sample);
            }
        }
    }

    let memory = engine.memory(id).unwrap_or(&[]);
    let remembered = memory.iter().filter(|&&m| m > 0.5).count();
    println!();
    println!("=== Visibility Memory Summary ===");
    println!("Asset:      {} ({} points)", asset_name, memory.len());
    println!("Simulated:  {:.1}s in {} frames", timer.elapsed_secs(), timer.frame_count());
    println!("Wall time:  {:.2}s", start.elapsed().as_secs_f64());
    println!("Remembered: {} points above 0.5 ({:.1}%)",
        remembered,
        100.0 * remembered as f64 / memory.len().max(1) as f64);

    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
