//! main.rs — TUSS4470 echo frame simulator entry point
//!
//! Streams byte-exact 3608-byte framed packets at a configured frame rate,
//! so the backend can be developed and demoed without the sonar hardware.
//! Point the sink at a pipe or pty and set the backend's SERIAL_PATH to the
//! other end:
//!
//! ```sh
//! socat -d -d pty,raw,echo=0,link=/tmp/sonar-sim pty,raw,echo=0,link=/tmp/sonar-dev &
//! sonar-sim --out /tmp/sonar-sim --fps 20 --target 400:200:11:0.5
//! SERIAL_PATH=/tmp/sonar-dev sonar-backend
//! ```
//!
//! `--corrupt-rate` flips a random payload byte in a fraction of frames to
//! exercise the backend's checksum resync path.

mod envelope;

use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::time::interval;
use tracing::{info, warn};

use envelope::{generate, EnvelopeConfig, Target};
use sonar_types::{encode_frame, META_LEN};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sonar-sim", about = "TUSS4470 echo frame simulator")]
struct Args {
    /// Output sink: a file, FIFO or pty; "-" for stdout
    #[arg(short, long, default_value = "-")]
    out: String,
    /// Frames per second
    #[arg(long, default_value = "20.0")]
    fps: f64,
    /// Simulated reflectors, index:amplitude:width[:drift] (repeatable)
    #[arg(long = "target", value_parser = Target::parse)]
    targets: Vec<Target>,
    /// Background hiss mean
    #[arg(long, default_value = "20.0")]
    noise_mean: f64,
    /// Background hiss standard deviation
    #[arg(long, default_value = "6.0")]
    noise_sigma: f64,
    /// Fraction of frames with one corrupted payload byte
    #[arg(long, default_value = "0.0")]
    corrupt_rate: f64,
    /// Stop after this many frames (0 = run forever)
    #[arg(long, default_value = "0")]
    frames: u64,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonar_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = EnvelopeConfig {
        noise_mean: args.noise_mean,
        noise_sigma: args.noise_sigma,
        ..EnvelopeConfig::default()
    };
    let mut targets = args.targets.clone();

    info!(
        "🔊 Sonar simulator starting — {} target(s), {:.0} fps → {}",
        targets.len(),
        args.fps,
        args.out
    );

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = if args.out == "-" {
        Box::new(tokio::io::stdout())
    } else {
        match tokio::fs::OpenOptions::new().write(true).create(true).open(&args.out).await {
            Ok(f) => Box::new(f),
            Err(e) => {
                warn!("cannot open {}: {e}", args.out);
                std::process::exit(1);
            }
        }
    };

    let period = Duration::from_secs_f64(1.0 / args.fps.max(0.1));
    let mut ticker = interval(period);
    let mut rng = rand::thread_rng();
    let mut seq: u64 = 0;

    loop {
        ticker.tick().await;

        for t in targets.iter_mut() {
            t.step(&mut rng);
        }
        let samples = generate(&cfg, &targets, &mut rng);

        // Metadata: frame counter in the first two bytes, rest reserved.
        let mut meta = [0u8; META_LEN];
        meta[..2].copy_from_slice(&(seq as u16).to_be_bytes());

        let mut packet = encode_frame(&meta, &samples);
        if args.corrupt_rate > 0.0 && rng.gen_bool(args.corrupt_rate.min(1.0)) {
            let at = rng.gen_range(1..packet.len() - 1);
            packet[at] ^= 0x01;
        }

        if let Err(e) = sink.write_all(&packet).await {
            warn!("sink write failed: {e}");
            std::process::exit(1);
        }
        let _ = sink.flush().await;

        seq += 1;
        if args.frames > 0 && seq >= args.frames {
            info!("done: {seq} frames");
            return;
        }
    }
}
