//! Fusion of the high-rate echo stream with the slow GPS stream.
//!
//! Every processed frame appends one record carrying the most recent fix
//! snapshot (by value — never a reference into live GPS state). The buffer
//! drains exactly once per valid fix, producing the `sonar_batch` event;
//! the throttled `sonar_readings` row is decided here but written by the
//! frame task, so persistence never reorders against the emit that clears
//! the buffer.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::gps::GpsSnapshot;
use crate::pipeline::FrameReport;

/// Hard cap on buffered records; oldest dropped on overflow. GPS normally
/// drains at 1 Hz, so this is ~50 s of headroom at 20 fps.
pub const FUSION_BUFFER_CAP: usize = 1024;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FusionRecord {
    pub timestamp_ms: i64,
    pub depth_cm: f64,
    pub peak_amplitude: u16,
    pub peak_index: usize,
    pub gps: Option<GpsSnapshot>,
}

/// One throttled `sonar_readings` row.
#[derive(Debug, Clone, PartialEq)]
pub struct SonarRow {
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub max_value: i32,
    pub max_sample_index: i32,
    pub max_distance_cm: f64,
}

/// One entry of a `sonar_batch` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchEntry {
    pub time: i64,
    pub depth_cm: f64,
    pub lat: f64,
    pub lon: f64,
}

/// What a valid fix produces: the drained batch (if any) plus the `gps`
/// event payload.
#[derive(Debug)]
pub struct FixEmit {
    pub batch: Option<Vec<BatchEntry>>,
    pub gps_event: Value,
}

/// Payload of the `gps` telemetry event. Shared by the fix path and the
/// replay-on-connect path.
pub fn gps_event(snap: &GpsSnapshot, depth_cm: f64) -> Value {
    json!({
        "lat": snap.lat,
        "lon": snap.lon,
        "alt": snap.alt,
        "speed": snap.speed,
        "track": snap.track,
        "time": snap.time,
        "fix_mode": snap.mode,
        "accuracy": snap.accuracy,
        "status": snap.status,
        "depth_m": depth_cm / 100.0,
    })
}

// ── Fusion state ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FusionState {
    buffer: VecDeque<FusionRecord>,
    last_gps: Option<GpsSnapshot>,
    last_db_write_ms: i64,
    /// Raw GPS messages persisted so far (drives `raw_count_update`).
    pub raw_count: u64,
}

impl FusionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_gps(&self) -> Option<&GpsSnapshot> {
        self.last_gps.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frame side: append one record and decide whether this frame carries
    /// a persistence write. A row is due when the throttle interval has
    /// elapsed and a fix snapshot exists.
    pub fn on_frame(&mut self, report: &FrameReport, cfg: &PipelineConfig) -> Option<SonarRow> {
        let (peak_index, peak_amplitude) = report.peak.unwrap_or((0, 0));
        let record = FusionRecord {
            timestamp_ms: report.timestamp_ms,
            depth_cm: report.depth_cm,
            peak_amplitude,
            peak_index,
            gps: self.last_gps.clone(),
        };
        self.buffer.push_back(record);
        while self.buffer.len() > FUSION_BUFFER_CAP {
            self.buffer.pop_front();
        }

        let latest = self.buffer.back()?;
        let now = latest.timestamp_ms;
        if now - self.last_db_write_ms < cfg.db_write_interval_ms {
            return None;
        }
        let gps = latest.gps.as_ref()?;
        self.last_db_write_ms = now;
        Some(SonarRow {
            timestamp_ms: latest.timestamp_ms,
            latitude: gps.lat,
            longitude: gps.lon,
            max_value: latest.peak_amplitude as i32,
            max_sample_index: latest.peak_index as i32,
            max_distance_cm: latest.depth_cm,
        })
    }

    /// GPS side: a valid fix (mode ≥ 2) lands. Stores the snapshot, drains
    /// the buffer into one batch, and builds the `gps` event.
    pub fn on_fix(&mut self, snap: GpsSnapshot, depth_cm: f64) -> FixEmit {
        self.last_gps = Some(snap.clone());

        let batch = if self.buffer.is_empty() {
            None
        } else {
            Some(
                self.buffer
                    .drain(..)
                    .map(|rec| {
                        // Records collected before the first fix borrow the
                        // incoming fix's position.
                        let (lat, lon) = rec
                            .gps
                            .as_ref()
                            .map(|g| (g.lat, g.lon))
                            .unwrap_or((snap.lat, snap.lon));
                        BatchEntry { time: rec.timestamp_ms, depth_cm: rec.depth_cm, lat, lon }
                    })
                    .collect(),
            )
        };

        FixEmit { batch, gps_event: gps_event(&snap, depth_cm) }
    }
}
