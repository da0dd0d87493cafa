//! Serial link to the TUSS4470 front-end.
//!
//! One task owns the port, the frame assembler, and the per-frame
//! transform. Exclusive ownership of the assembler is what makes the
//! reassembler single-entrant — there is no second reader to guard against.
//! The assembler survives port reopens so frame sequence numbers stay
//! monotonic across a flaky USB adapter.

use std::sync::Arc;
use std::time::Duration;

use sonar_types::{encode_depth_record, Frame, FrameAssembler};
use sqlx::PgPool;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::persistence;
use crate::pipeline::{now_ms, SharedPipeline};
use crate::raw_channel::RawSender;

/// Delay before reopening a failed port.
const REOPEN_DELAY: Duration = Duration::from_secs(2);
/// Checksum failures are warned about at most once per this window.
const CHECKSUM_WARN_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("cannot open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
}

/// Long-lived serial reader task.
///
/// The first open failure is returned as an error — a tracker booted
/// without its sonar is misconfigured and should exit non-zero. Every
/// later failure (cable yanked, adapter reset) tears the port down and
/// retries after [`REOPEN_DELAY`].
pub async fn run_serial_link(
    cfg: Arc<PipelineConfig>,
    shared: SharedPipeline,
    pool: PgPool,
    raw_tx: RawSender,
) -> Result<(), SerialError> {
    let mut assembler = FrameAssembler::new();
    let mut first_attempt = true;

    loop {
        let port = match tokio_serial::new(&cfg.serial_path, cfg.baud_rate).open_native_async() {
            Ok(p) => p,
            Err(source) if first_attempt => {
                return Err(SerialError::Open { path: cfg.serial_path.clone(), source });
            }
            Err(e) => {
                warn!("serial: reopen of {} failed: {e}, retrying in {REOPEN_DELAY:?}", cfg.serial_path);
                tokio::time::sleep(REOPEN_DELAY).await;
                continue;
            }
        };
        first_attempt = false;
        info!("📡 Sonar link open on {} @ {} baud", cfg.serial_path, cfg.baud_rate);

        read_frames(port, &mut assembler, &cfg, &shared, &pool, &raw_tx).await;

        warn!("serial: port lost, reopening in {REOPEN_DELAY:?}");
        tokio::time::sleep(REOPEN_DELAY).await;
    }
}

/// Pump the port until it errors or closes.
async fn read_frames(
    mut port: tokio_serial::SerialStream,
    assembler: &mut FrameAssembler,
    cfg: &PipelineConfig,
    shared: &SharedPipeline,
    pool: &PgPool,
    raw_tx: &RawSender,
) {
    let mut buf = vec![0u8; 4096];
    let mut warned_failures = 0u64;
    let mut last_warn_ms = 0i64;

    loop {
        match port.read(&mut buf).await {
            Ok(0) => {
                warn!("serial: stream closed by peer");
                return;
            }
            Ok(n) => {
                let frames = assembler.push(&buf[..n], now_ms());

                let now = now_ms();
                if assembler.checksum_failures > warned_failures
                    && now - last_warn_ms >= CHECKSUM_WARN_WINDOW_MS
                {
                    warn!(
                        "sonar: {} packets rejected on checksum ({} bytes discarded total)",
                        assembler.checksum_failures, assembler.discarded_bytes
                    );
                    warned_failures = assembler.checksum_failures;
                    last_warn_ms = now;
                }

                for frame in frames {
                    handle_frame(&frame, cfg, shared, pool, raw_tx).await;
                }
            }
            Err(e) => {
                warn!("serial: read error: {e}");
                return;
            }
        }
    }
}

/// Run one frame through the pipeline and fan the results out.
///
/// The state lock is held only for the synchronous transform; the binary
/// broadcast and the (rare) throttled insert happen after it is released.
async fn handle_frame(
    frame: &Frame,
    cfg: &PipelineConfig,
    shared: &SharedPipeline,
    pool: &PgPool,
    raw_tx: &RawSender,
) {
    let resolution_cm = cfg.sample_resolution_cm();

    let (db_row, records) = {
        let mut st = shared.write().await;
        let report = st.pipeline.process(frame);
        let db_row = st.fusion.on_frame(&report, cfg);
        let records: Vec<[u8; 3]> = report
            .detections
            .iter()
            .filter(|d| d.amplitude > cfg.emit_threshold)
            .map(|d| encode_depth_record(d.peak_range_mm(resolution_cm), d.amplitude))
            .collect();
        (db_row, records)
    };

    // Drop-tolerant: with no subscriber the send errors and the record is gone.
    for rec in records {
        let _ = raw_tx.send(rec);
    }

    if let Some(row) = db_row {
        if let Err(e) = persistence::insert_sonar_reading(pool, &row).await {
            warn!("db: sonar_readings insert failed: {e} (row dropped)");
        }
    }
}
