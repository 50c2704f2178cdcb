use criterion::{criterion_group, criterion_main, Criterion, black_box};
use std::sync::Arc;

use vismem::cloud::bake::box_mesh;
use vismem::cloud::{bake, BakeSettings};
use vismem::core::camera::Camera;
use vismem::core::types::{Mat4, Vec3};
use vismem::math::Aabb;
use vismem::visibility::{
    DepthSnapshot, MemoryIntegrator, OccluderSet, OcclusionMode, VisibilityConfig, VisibilityEngine,
};

fn building() -> Arc<vismem::cloud::PointCloudAsset> {
    let mesh = box_mesh("bench", Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 12.0, 4.0));
    Arc::new(bake(&mesh, &BakeSettings { density: 300.0, seed: 1 }).expect("bake failed"))
}

fn camera() -> Camera {
    Camera::look_at(Vec3::new(20.0, 6.0, 20.0), Vec3::new(0.0, 6.0, 0.0), Vec3::Y)
}

fn bench_bake_box(c: &mut Criterion) {
    let mesh = box_mesh("bench", Vec3::ZERO, Vec3::splat(4.0));

    c.bench_function("bake_box_density_300", |b| {
        b.iter(|| bake(black_box(&mesh), &BakeSettings { density: 300.0, seed: 0 }))
    });
}

fn bench_integrate_100k(c: &mut Criterion) {
    let integrator = MemoryIntegrator::new(0.4, 0.2);
    let signals: Vec<f32> = (0..100_000).map(|i| (i % 3 == 0) as u32 as f32).collect();
    let mut memory = vec![0.5f32; 100_000];

    c.bench_function("integrate_100k", |b| {
        b.iter(|| integrator.integrate(black_box(&mut memory), &signals, 1.0 / 60.0, 64))
    });
}

fn bench_tick_depth_snapshot(c: &mut Criterion) {
    let asset = building();
    let mut scene = OccluderSet::new();
    scene.add_box(Aabb::new(Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 12.0, 4.0)));

    let camera = camera();
    let depth = DepthSnapshot::trace(camera.view_projection(), 320, 180, &scene).expect("trace failed");
    let frame = camera.frame(320, 180, Some(depth));

    let mut engine = VisibilityEngine::new(VisibilityConfig::default()).expect("config");
    let id = engine.register("bench", Mat4::IDENTITY);
    engine.activate(id, asset.clone()).expect("activate");

    c.bench_function(&format!("tick_depth_snapshot_{}_points", asset.len()), |b| {
        b.iter(|| engine.tick(black_box(&frame), 1.0 / 60.0))
    });
}

fn bench_tick_ray_query(c: &mut Criterion) {
    let asset = building();
    let mut scene = OccluderSet::new();
    scene.add_box(Aabb::new(Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 12.0, 4.0)));

    let config = VisibilityConfig {
        occlusion_mode: OcclusionMode::RayQuery,
        ..Default::default()
    };
    let mut engine = VisibilityEngine::new(config).expect("config").with_ray_query(Arc::new(scene));
    let id = engine.register("bench", Mat4::IDENTITY);
    engine.activate(id, asset.clone()).expect("activate");
    let frame = camera().frame(320, 180, None);

    c.bench_function(&format!("tick_ray_query_{}_points", asset.len()), |b| {
        b.iter(|| engine.tick(black_box(&frame), 1.0 / 60.0))
    });
}

fn bench_trace_snapshot(c: &mut Criterion) {
    let mut scene = OccluderSet::new();
    scene.add_box(Aabb::new(Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 12.0, 4.0)));
    let vp = camera().view_projection();

    c.bench_function("trace_snapshot_320x180", |b| {
        b.iter(|| DepthSnapshot::trace(black_box(vp), 320, 180, &scene))
    });
}

criterion_group!(
    benches,
    bench_bake_box,
    bench_integrate_100k,
    bench_tick_depth_snapshot,
    bench_tick_ray_query,
    bench_trace_snapshot,
);
criterion_main!(benches);
