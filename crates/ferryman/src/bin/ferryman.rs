//! Ferryman soak binary
//!
//! Runs the relay against the in-process engine and server until Ctrl-C:
//! a sine tone goes out through playback and comes back on the monitor,
//! and the capture source is fed a slow ramp. Prints relay stats as JSON
//! on exit. The exit status is non-zero if the relay failed.
//!
//! Usage: `ferryman [config.toml]`

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ferryconf::FerryConfig;
use ferryman::sim::{SimEngine, SimServer};
use ferryman::{BridgeConfig, ExitReason, Session};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 48000;
const PERIOD_FRAMES: u32 = 256;
const TONE_HZ: f32 = 440.0;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = FerryConfig::load_from(config_path.as_deref()).context("loading config")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.telemetry.log_level))
        .init();

    info!("ferryman {} starting (sim backends)", env!("CARGO_PKG_VERSION"));

    let engine = SimEngine::new(config.relay.client_name.clone(), SAMPLE_RATE, PERIOD_FRAMES);
    let engine_handle = engine.handle();
    let server = SimServer::new();
    let server_handle = server.handle();

    let bridge = BridgeConfig::from(&config);
    let session = Session::start(&bridge, Box::new(engine), Box::new(server))?;

    let mut phase = 0.0f32;
    let step = TAU * TONE_HZ / SAMPLE_RATE as f32;
    let clock = engine_handle.spawn_clock(move |frames, channels| {
        let tone: Vec<f32> = (0..frames)
            .map(|_| {
                phase = (phase + step) % TAU;
                0.25 * phase.sin()
            })
            .collect();
        vec![tone; channels]
    })?;

    let cancel = session.cancel_token();
    let channels = usize::from(config.relay.channels);
    let feeder = tokio::spawn(async move {
        let period = Duration::from_secs_f64(PERIOD_FRAMES as f64 / SAMPLE_RATE as f64);
        let mut tick = tokio::time::interval(period);
        let mut level = 0.0f32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    level = (level + 0.01) % 1.0;
                    let samples = vec![level; PERIOD_FRAMES as usize * channels];
                    if !server_handle.push_capture(&samples) {
                        tracing::debug!("capture not streaming yet");
                    }
                }
            }
        }
    });

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            session.shutdown();
            ExitReason::Requested
        }
        reason = session.wait() => reason,
    };
    info!("session stopping: {:?}", reason);

    let periods = clock.stop();
    if let Err(e) = feeder.await {
        warn!("capture feeder ended badly: {}", e);
    }

    let stats = session.stats();
    let reason = match session.close() {
        Ok(reason) => reason,
        Err(e) => {
            error!("relay failed: {}", e);
            ExitReason::Failed
        }
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!("ferryman stopped after {} periods: {:?}", periods, reason);
    std::process::exit(reason.exit_code());
}
