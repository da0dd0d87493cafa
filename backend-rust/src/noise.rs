//! Noise floor and blind-zone estimation.
//!
//! Every frame contributes one per-frame floor (arithmetic mean of the tail
//! `NOISE_FLOOR_RANGE` samples — the far range is assumed empty of targets).
//! The floors feed two long-running estimators:
//!
//! 1. Welford `(count, mean, variance, min, max)` — numerically stable,
//!    never re-sums history. The dynamic detection threshold downstream is
//!    `mean + snr_factor · √variance`.
//! 2. A slow EMA of the floor, used for the blind-zone threshold so a single
//!    hot frame cannot move the suppression boundary.
//!
//! The blind zone is the leading stretch of samples dominated by transducer
//! ring-down; nothing in it is eligible for peak detection.

use std::collections::VecDeque;

use crate::config::PipelineConfig;

/// Floor below which the noise mean is not trusted for thresholding.
/// A near-zero mean would otherwise collapse the blind-zone threshold.
const BZ_ABSOLUTE_FLOOR: f64 = 50.0;

/// Blind-zone boundary values averaged to smooth jitter.
const BZ_HISTORY: usize = 8;

// ── Welford running statistics ────────────────────────────────────────────────

/// Online mean/variance over per-frame noise floors.
#[derive(Debug, Clone, Default)]
pub struct NoiseStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl NoiseStats {
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = x;
            self.min = x;
            self.max = x;
            return;
        }
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance. Zero until two observations exist.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

// ── Per-frame outputs ─────────────────────────────────────────────────────────

/// What the estimator hands the extractor for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameNoise {
    /// Mean of the tail samples of this frame.
    pub floor: f64,
    /// `max(value_threshold, mean + snr·σ)` — never NaN, never below the
    /// static gate.
    pub dynamic_threshold: f64,
    /// First sample index eligible for peak detection (smoothed).
    pub blind_zone: usize,
}

// ── Tracker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NoiseTracker {
    stats: NoiseStats,
    ema_mean: f64,
    recent_bz: VecDeque<usize>,
}

impl NoiseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &NoiseStats {
        &self.stats
    }

    /// Long-running EMA of the floor (blind-zone threshold input).
    pub fn ema_mean(&self) -> f64 {
        self.ema_mean
    }

    /// Ingest one frame: update the running estimators and locate the
    /// blind-zone end. Called exactly once per validated frame.
    pub fn observe(&mut self, samples: &[u16], cfg: &PipelineConfig) -> FrameNoise {
        let floor = per_frame_floor(samples, cfg.noise_floor_range);
        self.stats.update(floor);
        self.ema_mean = if self.stats.count() == 1 {
            floor
        } else {
            cfg.noise_ema_alpha * floor + (1.0 - cfg.noise_ema_alpha) * self.ema_mean
        };

        let raw_bz = blind_zone_end(samples, self.ema_mean, cfg);
        self.recent_bz.push_back(raw_bz);
        if self.recent_bz.len() > BZ_HISTORY {
            self.recent_bz.pop_front();
        }
        let blind_zone =
            self.recent_bz.iter().sum::<usize>() / self.recent_bz.len();

        FrameNoise {
            floor,
            dynamic_threshold: self.dynamic_threshold(cfg),
            blind_zone,
        }
    }

    /// `DYN = mean + snr · √variance`, clamped to the static gate.
    /// Cold start (fewer than two frames) falls back to the gate alone.
    pub fn dynamic_threshold(&self, cfg: &PipelineConfig) -> f64 {
        if self.stats.count() < 2 {
            return cfg.value_threshold;
        }
        let dyn_thr = self.stats.mean() + cfg.snr_factor * self.stats.variance().sqrt();
        if dyn_thr.is_finite() {
            dyn_thr.max(cfg.value_threshold)
        } else {
            cfg.value_threshold
        }
    }
}

/// Arithmetic mean of the last `range` samples.
pub fn per_frame_floor(samples: &[u16], range: usize) -> f64 {
    let range = range.clamp(1, samples.len());
    let tail = &samples[samples.len() - range..];
    tail.iter().map(|&s| s as f64).sum::<f64>() / range as f64
}

/// First index where the envelope has decayed to the noise level, i.e. the
/// end of the transducer ring-down. Returns the scan limit if the envelope
/// never comes down inside it.
fn blind_zone_end(samples: &[u16], noise_mean: f64, cfg: &PipelineConfig) -> usize {
    let limit = cfg.max_bz_search_samples.min(samples.len());
    let threshold = noise_mean.max(BZ_ABSOLUTE_FLOOR) * cfg.bz_margin;
    for (i, &s) in samples.iter().enumerate().take(limit).skip(cfg.ignore_first_samples) {
        if (s as f64) <= threshold {
            return i;
        }
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PipelineConfig {
        PipelineConfig {
            value_threshold: 60.0,
            snr_factor: 3.0,
            noise_floor_range: 100,
            max_bz_search_samples: 300,
            ignore_first_samples: 2,
            bz_margin: 1.0,
            noise_ema_alpha: 0.1,
            ..PipelineConfig::default()
        }
    }

    fn flat_frame(level: u16) -> Vec<u16> {
        vec![level; 1800]
    }

    #[test]
    fn welford_matches_closed_form() {
        let mut st = NoiseStats::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            st.update(x);
        }
        assert!((st.mean() - 5.0).abs() < 1e-12);
        assert!((st.variance() - 4.0).abs() < 1e-12);
        assert_eq!(st.min(), 2.0);
        assert_eq!(st.max(), 9.0);
        assert_eq!(st.count(), 8);
    }

    #[test]
    fn mean_stays_within_observed_bounds() {
        let mut st = NoiseStats::default();
        for x in [10.0, 300.0, 55.0, 42.0, 199.0] {
            st.update(x);
            assert!(st.mean() >= st.min() && st.mean() <= st.max());
        }
    }

    #[test]
    fn cold_start_falls_back_to_static_gate() {
        let tracker = NoiseTracker::new();
        let c = cfg();
        assert_eq!(tracker.dynamic_threshold(&c), 60.0);
    }

    #[test]
    fn dynamic_threshold_never_below_gate() {
        let mut tracker = NoiseTracker::new();
        let c = cfg();
        // Dead-quiet input: mean 0, variance 0.
        for _ in 0..5 {
            tracker.observe(&flat_frame(0), &c);
        }
        assert_eq!(tracker.dynamic_threshold(&c), 60.0);
    }

    #[test]
    fn dynamic_threshold_tracks_noisy_input() {
        let mut tracker = NoiseTracker::new();
        let c = cfg();
        // Alternate tail levels so the variance is non-zero.
        for i in 0..20 {
            let level = if i % 2 == 0 { 80 } else { 120 };
            tracker.observe(&flat_frame(level), &c);
        }
        let thr = tracker.dynamic_threshold(&c);
        // mean = 100, σ = 20 → DYN = 160
        assert!((thr - 160.0).abs() < 1e-9);
        assert!(thr.is_finite());
    }

    #[test]
    fn blind_zone_finds_ring_down_end() {
        let c = cfg();
        let mut samples = vec![0u16; 1800];
        // Ring-down: hot until index 60, quiet after.
        for s in samples.iter_mut().take(60) {
            *s = 900;
        }
        let mut tracker = NoiseTracker::new();
        let noise = tracker.observe(&samples, &c);
        assert_eq!(noise.blind_zone, 60);
    }

    #[test]
    fn blind_zone_caps_at_search_limit() {
        let c = cfg();
        let samples = vec![2000u16; 1800]; // never decays
        let mut tracker = NoiseTracker::new();
        let noise = tracker.observe(&samples, &c);
        assert_eq!(noise.blind_zone, c.max_bz_search_samples);
    }

    #[test]
    fn quiet_frames_keep_blind_zone_at_skip_boundary() {
        let c = cfg();
        let mut tracker = NoiseTracker::new();
        // All-zero envelope: threshold is clamped at the absolute floor, so
        // the scan ends right at ignore_first_samples.
        let noise = tracker.observe(&flat_frame(0), &c);
        assert_eq!(noise.blind_zone, c.ignore_first_samples);
    }
}
