//! Per-frame processing: one validated frame in, one report out.
//!
//! The whole transform (noise → blind zone → extraction → tracking →
//! depth smoothing) is synchronous; the serial task runs it under a single
//! write lock so frames are processed atomically and strictly in arrival
//! order.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sonar_types::Frame;
use tokio::sync::RwLock;

use crate::config::PipelineConfig;
use crate::extract::{extract, Detection};
use crate::fusion::FusionState;
use crate::noise::NoiseTracker;
use crate::tracker::Tracker;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Depth smoother ────────────────────────────────────────────────────────────

/// EMA over the primary target's range. Zero observations (no primary this
/// frame) leave the value untouched; the first non-zero observation seeds it.
#[derive(Debug, Default)]
pub struct DepthSmoother {
    value_cm: f64,
    initialized: bool,
}

impl DepthSmoother {
    pub fn update(&mut self, range_cm: f64, alpha: f64) -> f64 {
        if range_cm > 0.0 {
            if self.initialized {
                self.value_cm = alpha * range_cm + (1.0 - alpha) * self.value_cm;
            } else {
                self.value_cm = range_cm;
                self.initialized = true;
            }
        }
        self.value_cm
    }

    pub fn depth_cm(&self) -> f64 {
        self.value_cm
    }
}

// ── Frame report ──────────────────────────────────────────────────────────────

/// Everything downstream consumers need from one processed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub blind_zone: usize,
    pub dynamic_threshold: f64,
    pub detections: Vec<Detection>,
    /// Median index of the primary persistent track, if any.
    pub primary_index: Option<f64>,
    /// Smoothed primary range, centimetres.
    pub depth_cm: f64,
    /// Strongest detection this frame (peak index, amplitude), for the
    /// throttled persistence row.
    pub peak: Option<(usize, u16)>,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct SonarPipeline {
    cfg: Arc<PipelineConfig>,
    noise: NoiseTracker,
    tracker: Tracker,
    depth: DepthSmoother,
    pub frames_processed: u64,
}

impl SonarPipeline {
    pub fn new(cfg: Arc<PipelineConfig>) -> Self {
        Self {
            cfg,
            noise: NoiseTracker::new(),
            tracker: Tracker::new(),
            depth: DepthSmoother::default(),
            frames_processed: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Latest smoothed primary depth, centimetres.
    pub fn depth_cm(&self) -> f64 {
        self.depth.depth_cm()
    }

    /// The atomic per-frame transform. Must not await; callers hold the
    /// state lock for exactly this call.
    pub fn process(&mut self, frame: &Frame) -> FrameReport {
        let cfg = self.cfg.clone();
        let noise = self.noise.observe(&frame.samples, &cfg);
        let detections = extract(
            &frame.samples,
            noise.blind_zone,
            noise.dynamic_threshold,
            &cfg,
        );

        self.tracker.step(
            &detections,
            self.noise.stats().variance(),
            frame.seq,
            &cfg,
        );

        let primary = self.tracker.primary(noise.blind_zone, &cfg);
        let primary_index = primary.map(|t| t.median());
        let primary_range_cm = primary_index
            .map(|idx| idx * cfg.sample_resolution_cm())
            .unwrap_or(0.0);
        let depth_cm = self.depth.update(primary_range_cm, cfg.ema_alpha);

        let peak = detections
            .iter()
            .max_by_key(|d| d.amplitude)
            .map(|d| (d.peak_index, d.amplitude));

        self.frames_processed += 1;

        FrameReport {
            seq: frame.seq,
            timestamp_ms: frame.timestamp_ms,
            blind_zone: noise.blind_zone,
            dynamic_threshold: noise.dynamic_threshold,
            detections,
            primary_index,
            depth_cm,
            peak,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Single owner of all mutable pipeline state, passed explicitly to the
/// producer tasks. The frame side writes `pipeline` and appends to
/// `fusion`; the GPS side drains `fusion` and owns the fix snapshot.
pub struct PipelineState {
    pub pipeline: SonarPipeline,
    pub fusion: FusionState,
}

pub type SharedPipeline = Arc<RwLock<PipelineState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_types::SAMPLES_PER_FRAME;

    fn frame(seq: u64, pulses: &[(usize, usize, u16)]) -> Frame {
        let mut samples = vec![0u16; SAMPLES_PER_FRAME];
        for &(at, width, amp) in pulses {
            for s in samples.iter_mut().skip(at).take(width) {
                *s = amp;
            }
        }
        Frame { seq, timestamp_ms: seq as i64 * 50, meta: [0; 6], samples }
    }

    fn test_cfg() -> PipelineConfig {
        PipelineConfig {
            value_threshold: 60.0,
            consistency_samples: 3,
            min_signal_separation: 20,
            consolidation_tolerance: 0,
            noise_floor_range: 100,
            ema_alpha: 0.1,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn smoother_alpha_one_is_identity() {
        let mut s = DepthSmoother::default();
        assert_eq!(s.update(123.0, 1.0), 123.0);
        assert_eq!(s.update(456.5, 1.0), 456.5);
    }

    #[test]
    fn smoother_ignores_zero_observations() {
        let mut s = DepthSmoother::default();
        s.update(100.0, 0.1);
        let before = s.depth_cm();
        assert_eq!(s.update(0.0, 0.1), before);
    }

    #[test]
    fn smoother_converges_toward_observation() {
        let mut s = DepthSmoother::default();
        s.update(100.0, 0.1);
        for _ in 0..100 {
            s.update(200.0, 0.1);
        }
        assert!((s.depth_cm() - 200.0).abs() < 1.0);
    }

    #[test]
    fn depth_tracks_primary_after_persistence() {
        let cfg = Arc::new(test_cfg());
        let mut pipeline = SonarPipeline::new(cfg.clone());
        let mut last = None;
        for seq in 0..5 {
            last = Some(pipeline.process(&frame(seq, &[(400, 11, 200)])));
        }
        let report = last.unwrap();
        assert_eq!(report.detections.len(), 1);
        assert!(report.primary_index.is_some());
        let expected = 405.0 * cfg.sample_resolution_cm();
        assert!((report.depth_cm - expected).abs() < 1e-6);
        assert_eq!(report.peak, Some((405, 200)));
    }

    #[test]
    fn identical_input_is_deterministic() {
        let cfg = Arc::new(test_cfg());
        let mut a = SonarPipeline::new(cfg.clone());
        let mut b = SonarPipeline::new(cfg);
        for seq in 0..10 {
            let f = frame(seq, &[(700, 6, 300), (1200, 4, 90)]);
            let ra = a.process(&f);
            let rb = b.process(&f);
            assert_eq!(ra.detections, rb.detections);
            assert_eq!(ra.depth_cm, rb.depth_cm);
            assert_eq!(ra.primary_index, rb.primary_index);
        }
    }

    #[test]
    fn no_detections_leave_depth_unchanged() {
        let cfg = Arc::new(test_cfg());
        let mut pipeline = SonarPipeline::new(cfg);
        for seq in 0..5 {
            pipeline.process(&frame(seq, &[(500, 8, 250)]));
        }
        let with_target = pipeline.process(&frame(5, &[(500, 8, 250)])).depth_cm;
        let empty = pipeline.process(&frame(6, &[])).depth_cm;
        assert!((with_target - empty).abs() < 1e-9);
    }
}
