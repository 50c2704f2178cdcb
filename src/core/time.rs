//! Frame timing utilities

use std::time::{Duration, Instant};

/// Tracks frame timing for the per-frame visibility tick.
///
/// Works either against the wall clock (`tick`) or with a fixed simulated
/// step (`advance`), which is what the headless driver and tests use.
pub struct FrameTimer {
    last_frame: Instant,
    delta: Duration,
    elapsed: Duration,
    frame_count: u64,
    fps_timer: Duration,
    fps: f32,
    fps_frame_count: u32,
}

impl FrameTimer {
    /// Create a new frame timer
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            delta: Duration::ZERO,
            elapsed: Duration::ZERO,
            frame_count: 0,
            fps_timer: Duration::ZERO,
            fps: 0.0,
            fps_frame_count: 0,
        }
    }

    /// Call once per frame to update timing from the wall clock
    pub fn tick(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_frame;
        self.last_frame = now;
        self.record(delta);
    }

    /// Advance by a fixed simulated step
    pub fn advance(&mut self, step: Duration) {
        self.last_frame = Instant::now();
        self.record(step);
    }

    fn record(&mut self, delta: Duration) {
        self.delta = delta;
        self.elapsed += delta;
        self.frame_count += 1;
        self.fps_frame_count += 1;
        self.fps_timer += delta;

        // Update FPS every (simulated) second
        if self.fps_timer >= Duration::from_secs(1) {
            self.fps = self.fps_frame_count as f32 / self.fps_timer.as_secs_f32();
            self.fps_frame_count = 0;
            self.fps_timer = Duration::ZERO;
        }
    }

    /// Get delta time in seconds
    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Total time accumulated since creation, in seconds
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed.as_secs_f32()
    }

    /// Get current FPS (updated every second)
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Get total frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}
