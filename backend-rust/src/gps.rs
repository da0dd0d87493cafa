//! GPS producer link.
//!
//! Spawns a `gpspipe -w`-equivalent child process and consumes its
//! line-delimited JSON. Messages are a tagged sum over `{TPV, SKY, other}`;
//! everything but TPV and SKY is ignored. The child exiting is routine
//! (USB GPS unplugged, gpsd restart): log, wait 5 s, respawn — the pipeline
//! itself never stops.

use std::time::Duration;

use serde::Deserialize;
use socketioxide::SocketIo;
use sqlx::PgPool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::persistence;
use crate::pipeline::{now_ms, SharedPipeline};

/// Delay before respawning a dead GPS producer.
const RESPAWN_DELAY: Duration = Duration::from_secs(5);

// ── Wire messages ─────────────────────────────────────────────────────────────

/// Time-position-velocity report. Only the fields the pipeline consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Tpv {
    /// NMEA fix mode: 0/1 = none, 2 = 2-D, 3 = 3-D.
    #[serde(default)]
    pub mode: u8,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    /// RFC 3339 timestamp, UTC.
    pub time: Option<String>,
    /// Speed over ground, m/s.
    pub speed: Option<f64>,
    /// Course over ground, degrees true.
    pub track: Option<f64>,
    /// Longitude error estimate, metres.
    pub epx: Option<f64>,
    /// Latitude error estimate, metres.
    pub epy: Option<f64>,
    pub status: Option<i32>,
}

impl Tpv {
    /// Horizontal accuracy: `√(epx² + epy²)`, when both estimates exist.
    pub fn horizontal_accuracy(&self) -> Option<f64> {
        match (self.epx, self.epy) {
            (Some(x), Some(y)) => Some((x * x + y * y).sqrt()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Satellite {
    #[serde(default)]
    pub used: bool,
}

/// Sky view: only the satellite list matters (used vs total counts).
#[derive(Debug, Clone, Deserialize)]
pub struct Sky {
    #[serde(default)]
    pub satellites: Vec<Satellite>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "class")]
pub enum GpsMessage {
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(rename = "SKY")]
    Sky(Sky),
    #[serde(other)]
    Other,
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Immutable copy of the latest accepted fix. Fusion records hold these by
/// value, never by reference into live GPS state.
#[derive(Debug, Clone)]
pub struct GpsSnapshot {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub mode: u8,
    pub accuracy: Option<f64>,
    pub status: Option<i32>,
    pub time: Option<String>,
    pub received_ms: i64,
}

impl GpsSnapshot {
    fn from_tpv(tpv: &Tpv, lat: f64, lon: f64, received_ms: i64) -> Self {
        Self {
            lat,
            lon,
            alt: tpv.alt,
            speed: tpv.speed,
            track: tpv.track,
            mode: tpv.mode,
            accuracy: tpv.horizontal_accuracy(),
            status: tpv.status,
            time: tpv.time.clone(),
            received_ms,
        }
    }
}

// ── Producer task ─────────────────────────────────────────────────────────────

/// Long-lived GPS link task: spawn the producer, consume lines, respawn on
/// exit. Never returns.
pub async fn run_gps_link(shared: SharedPipeline, io: SocketIo, pool: PgPool) {
    let bin = std::env::var("GPSPIPE_BIN").unwrap_or_else(|_| "gpspipe".to_string());
    info!("🛰  GPS link starting ({bin} -w)");

    loop {
        let mut child = match Command::new(&bin)
            .arg("-w")
            .stdout(std::process::Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("gps: failed to spawn {bin}: {e}, retrying in {RESPAWN_DELAY:?}");
                tokio::time::sleep(RESPAWN_DELAY).await;
                continue;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                handle_line(&line, &shared, &io, &pool).await;
            }
        }

        let status = child.wait().await;
        warn!("gps: producer exited ({status:?}), respawning in {RESPAWN_DELAY:?}");
        tokio::time::sleep(RESPAWN_DELAY).await;
    }
}

async fn handle_line(line: &str, shared: &SharedPipeline, io: &SocketIo, pool: &PgPool) {
    let raw: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("gps: unparseable line ({e}): {line}");
            return;
        }
    };

    // Every raw message is archived; the counter event lets clients show
    // link liveness without subscribing to the data itself.
    match persistence::insert_gps_raw(pool, &raw).await {
        Ok(()) => {
            let mut st = shared.write().await;
            st.fusion.raw_count += 1;
            drop(st);
            let _ = io.emit("raw_count_update", &serde_json::json!({}));
        }
        Err(e) => warn!("db: gps_raw insert failed: {e} (message dropped)"),
    }

    match serde_json::from_value::<GpsMessage>(raw) {
        Ok(GpsMessage::Tpv(tpv)) => handle_tpv(&tpv, shared, io, pool).await,
        Ok(GpsMessage::Sky(sky)) => {
            let total = sky.satellites.len();
            let used = sky.satellites.iter().filter(|s| s.used).count();
            let _ = io.emit(
                "satellite_update",
                &serde_json::json!({ "used": used, "total": total }),
            );
        }
        Ok(GpsMessage::Other) => {}
        Err(e) => debug!("gps: ignoring malformed message: {e}"),
    }
}

async fn handle_tpv(tpv: &Tpv, shared: &SharedPipeline, io: &SocketIo, pool: &PgPool) {
    // Only 2-D or better fixes with coordinates gate the fusion buffer.
    let (lat, lon) = match (tpv.mode >= 2, tpv.lat, tpv.lon) {
        (true, Some(lat), Some(lon)) => (lat, lon),
        _ => return,
    };
    let snap = GpsSnapshot::from_tpv(tpv, lat, lon, now_ms());

    // Persist the point before the emit that clears the buffer.
    if let Err(e) = persistence::insert_gps_point(pool, &snap).await {
        warn!("db: gps_points insert failed: {e} (row dropped)");
    }

    let emit = {
        let mut st = shared.write().await;
        let depth_cm = st.pipeline.depth_cm();
        st.fusion.on_fix(snap, depth_cm)
    };

    if let Some(batch) = emit.batch {
        let _ = io.emit("sonar_batch", &batch);
    }
    let _ = io.emit("gps", &emit.gps_event);
}
