//! Cosmetic per-point jitter written to the final-position buffer

use rayon::prelude::*;
use std::f32::consts::TAU;

use crate::core::types::{Vec3, Vec4};
use super::config::VisibilityConfig;

/// Per-axis scale so the combined offset never exceeds the amplitude
const AXIS_SCALE: f32 = 0.577_35;

/// Relative angular speeds of the three axes
const AXIS_SPEED: [f32; 3] = [1.0, 1.31, 0.77];

/// Bounded, time-varying offset. A zero amplitude disables drift entirely.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Drift {
    pub amplitude: f32,
    /// Angular frequency in radians per second
    pub frequency: f32,
}

/// Integer hash shared with the kernel (lowbias32)
#[inline]
pub fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

impl Drift {
    pub fn new(amplitude: f32, frequency: f32) -> Self {
        Self { amplitude, frequency }
    }

    pub fn from_config(config: &VisibilityConfig) -> Self {
        Self::new(config.drift_amplitude, config.drift_frequency)
    }

    pub fn is_enabled(&self) -> bool {
        self.amplitude > 0.0
    }

    fn phase(index: u32, axis: u32) -> f32 {
        let h = hash_u32(index.wrapping_mul(3).wrapping_add(axis));
        (h as f32 / u32::MAX as f32) * TAU
    }

    /// Per-axis wave angle at `time`, reduced to [0, TAU) in double precision
    /// so long-running sessions keep full phase resolution.
    pub fn axis_phases(&self, time: f64) -> [f32; 3] {
        let tau = std::f64::consts::TAU;
        AXIS_SPEED.map(|speed| (self.frequency as f64 * speed as f64 * time).rem_euclid(tau) as f32)
    }

    /// Offset for point `index` at `time` seconds; length <= amplitude
    pub fn offset(&self, index: u32, time: f64) -> Vec3 {
        self.offset_at(index, self.axis_phases(time))
    }

    /// Offset for point `index` given precomputed [`Self::axis_phases`]
    pub fn offset_at(&self, index: u32, phases: [f32; 3]) -> Vec3 {
        if !self.is_enabled() {
            return Vec3::ZERO;
        }
        let wave = |axis: u32| (phases[axis as usize] + Self::phase(index, axis)).sin();
        Vec3::new(wave(0), wave(1), wave(2)) * (self.amplitude * AXIS_SCALE)
    }

    /// Write `position + offset` for every point, in parallel batches
    pub fn apply(&self, positions: &[Vec3], out: &mut [Vec4], time: f64, group: usize) {
        debug_assert_eq!(positions.len(), out.len());
        let group = group.max(1);
        let phases = self.axis_phases(time);
        out.par_chunks_mut(group)
            .zip(positions.par_chunks(group))
            .enumerate()
            .for_each(|(batch, (dst, src))| {
                let base = batch * group;
                for (k, (d, &p)) in dst.iter_mut().zip(src).enumerate() {
                    *d = (p + self.offset_at((base + k) as u32, phases)).extend(1.0);
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_bounded() {
        let drift = Drift::new(0.25, 3.0);
        for index in 0..500u32 {
            for step in 0..40 {
                let len = drift.offset(index, step as f64 * 0.137).length();
                assert!(len <= 0.25 * (1.0 + 1e-5), "index {} len {}", index, len);
            }
        }
    }

    #[test]
    fn test_disabled() {
        let drift = Drift::new(0.0, 5.0);
        assert!(!drift.is_enabled());
        assert_eq!(drift.offset(17, 2.5), Vec3::ZERO);
    }

    #[test]
    fn test_varies_over_time_and_points() {
        let drift = Drift::new(1.0, 2.0);
        assert_ne!(drift.offset(3, 0.0), drift.offset(3, 0.5));
        assert_ne!(drift.offset(3, 0.5), drift.offset(4, 0.5));
    }

    #[test]
    fn test_apply_matches_offset() {
        let drift = Drift::new(0.1, 1.0);
        let positions: Vec<Vec3> = (0..100).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let mut out = vec![Vec4::ZERO; 100];
        drift.apply(&positions, &mut out, 1.5, 16);
        for (i, v) in out.iter().enumerate() {
            let expected = positions[i] + drift.offset(i as u32, 1.5);
            assert_eq!(v.truncate(), expected);
            assert_eq!(v.w, 1.0);
        }
    }

    #[test]
    fn test_phases_stay_precise_after_long_sessions() {
        let drift = Drift::new(0.5, 2.0);
        // Ten days in, two frames 1/60 s apart must still move the wave
        let late = 864_000.0;
        let a = drift.axis_phases(late);
        let b = drift.axis_phases(late + 1.0 / 60.0);
        for axis in 0..3 {
            assert!((0.0..TAU).contains(&a[axis]));
            let step = (b[axis] - a[axis]).rem_euclid(TAU);
            let expected = 2.0 * AXIS_SPEED[axis] / 60.0;
            assert!((step - expected).abs() < 1e-4, "axis {} step {}", axis, step);
        }
        assert_ne!(drift.offset(9, late), drift.offset(9, late + 1.0 / 60.0));
    }
}
