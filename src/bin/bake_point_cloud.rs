//! Point cloud baker binary: samples a triangle mesh into a point cloud asset.
//!
//! Usage: cargo run --release --bin bake_point_cloud -- --mesh <FILE> [OPTIONS]
//!
//! Options:
//!   --mesh <FILE>       Mesh JSON: { name, positions, indices, normals? }
//!   --box <W,H,D>       Bake an axis-aligned box of this size instead of a mesh file
//!   --name <NAME>       Asset name when baking a box (default: "box")
//!   --density <D>       Points per square unit (default: 300)
//!   --seed <SEED>       Random seed (default: 0)
//!   --out <DIR>         Output directory (default: assets/point_clouds)
//!
//! Output: <DIR>/<name>.vpc (rkyv archive, LZ4 compressed)

use std::path::PathBuf;
use std::time::Instant;

use vismem::cloud::bake::box_mesh;
use vismem::cloud::disk_io::{asset_path, compress_asset};
use vismem::cloud::{bake, BakeSettings, MeshData, DEFAULT_DENSITY};
use vismem::core::types::Vec3;
use vismem::core::{logging, Error};

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!("bake_point_cloud: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<(), Error> {
    let density = parse_f32_arg(args, "--density").unwrap_or(DEFAULT_DENSITY);
    let seed = parse_u64_arg(args, "--seed").unwrap_or(0);
    let out_dir = parse_str_arg(args, "--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("assets/point_clouds"));

    let mesh = match (parse_str_arg(args, "--mesh"), parse_vec3_arg(args, "--box")) {
        (Some(path), _) => MeshData::from_json_file(&PathBuf::from(path))?,
        (None, Some(size)) => {
            let name = parse_str_arg(args, "--name").unwrap_or_else(|| "box".to_string());
            box_mesh(&name, -size * 0.5, size * 0.5)
        }
        (None, None) => {
            return Err(Error::Config("either --mesh <FILE> or --box <W,H,D> is required".to_string()));
        }
    };

    println!("=== Point Cloud Baker ===");
    println!("Mesh:    {} ({} vertices, {} triangles)", mesh.name, mesh.positions.len(), mesh.indices.len() / 3);
    println!("Density: {} points/unit^2", density);
    println!("Seed:    {}", seed);
    println!();

    let start = Instant::now();
    let asset = bake(&mesh, &BakeSettings { density, seed })?;
    let bake_time = start.elapsed();

    std::fs::create_dir_all(&out_dir)?;
    let path = asset_path(&out_dir, asset.name());
    let bytes = compress_asset(&asset)?;
    std::fs::write(&path, &bytes)?;

    let bounds = asset.bounds();
    println!("Points:  {}", asset.len());
    println!("Bounds:  {:?} .. {:?} (size {:?})", bounds.min, bounds.max, bounds.size());
    println!("Time:    {:.1} ms", bake_time.as_secs_f64() * 1000.0);
    println!("Size:    {:.1} KB on disk", bytes.len() as f64 / 1024.0);
    println!("Output:  {}", path.display());
    println!();
    println!("To run the visibility driver on it:");
    println!("  cargo run --release --bin vismem -- --asset \"{}\" --dir {}", asset.name(), out_dir.display());

    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Parse "x,y,z"
fn parse_vec3_arg(args: &[String], flag: &str) -> Option<Vec3> {
    let text = parse_str_arg(args, flag)?;
    let parts: Vec<f32> = text.split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
    match parts.as_slice() {
        [x, y, z] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}
