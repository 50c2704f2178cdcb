//! Per-point memory integration.
//!
//! Memory rises toward 1 while a point is observed and decays toward 0
//! while it is not:
//!
//! ```text
//! m' = clamp(m + dt * (learn * v * (1 - m) - forget * (1 - v) * m), 0, 1)
//! ```
//!
//! `v` is the observation signal for the frame (0 or 1 for the built-in
//! occlusion tests, any value in [0, 1] for analog confidence).

use rayon::prelude::*;

use super::config::VisibilityConfig;

/// Learn/forget integrator shared by the CPU path and mirrored by the kernel
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryIntegrator {
    pub learn_rate: f32,
    pub forget_rate: f32,
}

impl MemoryIntegrator {
    pub fn new(learn_rate: f32, forget_rate: f32) -> Self {
        Self { learn_rate, forget_rate }
    }

    pub fn from_config(config: &VisibilityConfig) -> Self {
        Self::new(config.learn_rate, config.forget_rate)
    }

    /// Advance one memory value by `dt` seconds under observation signal `signal`
    #[inline]
    pub fn step(&self, memory: f32, signal: f32, dt: f32) -> f32 {
        if dt <= 0.0 {
            return memory;
        }
        let v = signal.clamp(0.0, 1.0);
        let rise = self.learn_rate * v * (1.0 - memory);
        let fall = self.forget_rate * (1.0 - v) * memory;
        (memory + dt * (rise - fall)).clamp(0.0, 1.0)
    }

    /// Advance every slot in parallel batches of `group` points
    pub fn integrate(&self, memory: &mut [f32], signals: &[f32], dt: f32, group: usize) {
        debug_assert_eq!(memory.len(), signals.len());
        if dt <= 0.0 {
            return;
        }
        let group = group.max(1);
        memory
            .par_chunks_mut(group)
            .zip(signals.par_chunks(group))
            .for_each(|(mem, sig)| {
                for (m, &v) in mem.iter_mut().zip(sig) {
                    *m = self.step(*m, v, dt);
                }
            });
    }
}
