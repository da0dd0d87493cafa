//! Temporal tracking of acoustic returns.
//!
//! Electrical spikes and cross-talk produce convincing single-frame peaks;
//! real reflectors recur. Each detection is associated to a 1-D
//! constant-position Kalman track `(x, P)` and only tracks that persist for
//! `consistency_samples` frames count as real targets.
//!
//! ## Lifecycle
//! `PROVISIONAL` (persistence < threshold) → `PERSISTENT` (≥ threshold) →
//! decaying while unmatched → removed at persistence 0 or after
//! [`MISS_BOUND`] consecutive misses. Tracks above the threshold decay twice
//! as fast as those below, so a stale lock releases quickly while
//! re-acquisition stays cheap.
//!
//! ## Invariants
//! - Track IDs are monotonic and never reused.
//! - `0 ≤ persistence ≤ consistency_samples + PERSISTENCE_HEADROOM`.
//! - The per-track median over recent observations, not the filtered state,
//!   is what fusion and plotting consume (robust to single-frame outliers).

use std::collections::VecDeque;

use crate::config::PipelineConfig;
use crate::extract::Detection;

/// Constant-position process noise added to P each frame.
const PROCESS_NOISE_Q: f64 = 4.0;
/// Initial state uncertainty of a freshly spawned track.
const INITIAL_P: f64 = 100.0;
/// Persistence may overshoot the threshold by this much.
const PERSISTENCE_HEADROOM: u32 = 5;
/// Consecutive misses after which a track is dropped outright.
const MISS_BOUND: u32 = 5;
/// Association window widening per amplitude count.
const BOOST_PER_AMP: f64 = 1.0 / 25.0;
/// Cap on the amplitude-scaled widening.
const MAX_BOOST: f64 = 12.0;

// ── Track ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Track {
    /// Stable identifier, monotonic across the tracker's lifetime.
    pub id: u64,
    /// Filtered sample index.
    x: f64,
    /// State uncertainty.
    p: f64,
    /// Amplitude of the last matched detection.
    pub amplitude: u16,
    /// Frames seen, bounded by threshold + headroom.
    pub persistence: u32,
    /// Consecutive unmatched frames.
    pub misses: u32,
    /// Recent observed indices, capped at 2 · consistency_samples.
    history: VecDeque<f64>,
    /// Frame sequence number of the last match.
    pub last_seen: u64,
}

impl Track {
    fn new(id: u64, det: &Detection, frame_seq: u64) -> Self {
        let z = det.peak_index as f64;
        let mut history = VecDeque::new();
        history.push_back(z);
        Self {
            id,
            x: z,
            p: INITIAL_P,
            amplitude: det.amplitude,
            persistence: 1,
            misses: 0,
            history,
            last_seen: frame_seq,
        }
    }

    /// Filtered sample index.
    pub fn position(&self) -> f64 {
        self.x
    }

    /// Median of the recent observed indices. Used for plotting and fusion;
    /// a single wild frame cannot move it.
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<f64> = self.history.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        }
    }

    fn update(&mut self, det: &Detection, r: f64, history_cap: usize, max_persistence: u32, frame_seq: u64) {
        let z = det.peak_index as f64;
        let k = self.p / (self.p + r);
        self.x += k * (z - self.x);
        self.p *= 1.0 - k;
        self.amplitude = det.amplitude;
        self.persistence = (self.persistence + 1).min(max_persistence);
        self.misses = 0;
        self.history.push_back(z);
        while self.history.len() > history_cap {
            self.history.pop_front();
        }
        self.last_seen = frame_seq;
    }
}

// ── Tracker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Tracker {
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Advance one frame: predict, associate, update, decay, spawn.
    ///
    /// `noise_variance` sets the measurement noise R, so a hissy link
    /// trusts individual detections less.
    pub fn step(
        &mut self,
        detections: &[Detection],
        noise_variance: f64,
        frame_seq: u64,
        cfg: &PipelineConfig,
    ) {
        let r = noise_variance.max(1.0);
        let history_cap = (cfg.consistency_samples as usize * 2).max(1);
        let max_persistence = cfg.consistency_samples + PERSISTENCE_HEADROOM;

        // Predict: constant position, growing uncertainty.
        for t in &mut self.tracks {
            t.p += PROCESS_NOISE_Q;
        }

        // Associate greedily: each detection takes the nearest unclaimed
        // track inside its window; stronger echoes get a wider window.
        let mut claimed = vec![false; self.tracks.len()];
        let mut unmatched: Vec<&Detection> = Vec::new();
        for det in detections {
            let z = det.peak_index as f64;
            let window = cfg.position_tolerance
                + (det.amplitude as f64 * BOOST_PER_AMP).min(MAX_BOOST);
            let nearest = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, t)| !claimed[*i] && (t.x - z).abs() <= window)
                .min_by(|(_, a), (_, b)| {
                    (a.x - z).abs().total_cmp(&(b.x - z).abs())
                })
                .map(|(i, _)| i);
            match nearest {
                Some(i) => {
                    claimed[i] = true;
                    self.tracks[i].update(det, r, history_cap, max_persistence, frame_seq);
                }
                None => unmatched.push(det),
            }
        }

        // Decay unclaimed tracks; persistent ones decay twice as fast.
        for (i, t) in self.tracks.iter_mut().enumerate() {
            if claimed.get(i).copied().unwrap_or(false) {
                continue;
            }
            t.misses += 1;
            let step = if t.persistence > cfg.consistency_samples { 2 } else { 1 };
            t.persistence = t.persistence.saturating_sub(step);
        }
        self.tracks
            .retain(|t| t.persistence > 0 && t.misses <= MISS_BOUND);

        // Spawn tracks for leftover detections, up to the cap.
        for det in unmatched {
            if self.tracks.len() >= cfg.n_max {
                break;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track::new(id, det, frame_seq));
        }
    }

    /// Tracks that have crossed the persistence threshold.
    pub fn persistent<'a>(
        &'a self,
        cfg: &PipelineConfig,
    ) -> impl Iterator<Item = &'a Track> + 'a {
        let threshold = cfg.consistency_samples;
        self.tracks.iter().filter(move |t| t.persistence >= threshold)
    }

    /// The closest persistent track at or beyond the blind zone — the one
    /// the depth smoother follows.
    pub fn primary(&self, blind_zone: usize, cfg: &PipelineConfig) -> Option<&Track> {
        self.persistent(cfg)
            .filter(|t| t.median() >= blind_zone as f64)
            .min_by(|a, b| a.median().total_cmp(&b.median()))
    }
}
