mod config;
mod extract;
mod fusion;
mod gps;
mod noise;
mod persistence;
mod pipeline;
mod raw_channel;
mod serial;
mod tracker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use socketioxide::SocketIo;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use config::PipelineConfig;
use fusion::FusionState;
use pipeline::{now_ms, PipelineState, SharedPipeline, SonarPipeline};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "serverTime": now_ms() }))
}

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now = now_ms() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Socket.IO connect handler ────────────────────────────────────────────────

async fn on_connect(socket: socketioxide::extract::SocketRef, shared: SharedPipeline) {
    info!("client connected: {}", socket.id);
    // Replay the latest fix so a late-joining client renders immediately.
    let st = shared.read().await;
    if let Some(snap) = st.fusion.last_gps() {
        let payload = fusion::gps_event(snap, st.pipeline.depth_cm());
        let _ = socket.emit("gps", &payload);
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    STARTUP_MS.store(now_ms() as u64, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonar_backend=info,socketioxide=warn".into()),
        )
        .init();

    let cfg = Arc::new(PipelineConfig::default());
    info!(
        "🌊 Sonar Tracker Backend v{} starting — {} @ {} baud, {:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.serial_path,
        cfg.baud_rate,
        cfg.frequency,
    );

    // Database — credentials via environment only; missing or unreachable
    // is a startup failure.
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("database connection failed")?;
    info!("database connected");

    // Shared pipeline state
    let shared: SharedPipeline = Arc::new(RwLock::new(PipelineState {
        pipeline: SonarPipeline::new(cfg.clone()),
        fusion: FusionState::new(),
    }));

    // Binary high-rate channel
    let raw_tx = raw_channel::raw_channel();

    // Build Socket.IO layer
    let (socket_layer, io) = SocketIo::builder().build_layer();

    let shared_sock = shared.clone();
    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let shared = shared_sock.clone();
        async move {
            on_connect(socket, shared).await;
        }
    });

    // Serial producer — first open failure is fatal (sonar is required).
    let serial_cfg = cfg.clone();
    let serial_shared = shared.clone();
    let serial_pool = pool.clone();
    let serial_raw = raw_tx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            serial::run_serial_link(serial_cfg, serial_shared, serial_pool, serial_raw).await
        {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    });

    // GPS producer
    tokio::spawn(gps::run_gps_link(shared.clone(), io.clone(), pool.clone()));

    // CORS — tracker runs on a boat LAN; any origin may read telemetry.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build Axum router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .route("/raw", get(raw_channel::raw_ws_handler))
        .with_state(raw_tx)
        .layer(socket_layer)
        .layer(cors);

    let addr = format!("0.0.0.0:{}", cfg.http_port);
    info!("🚀 Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    Ok(())
}
