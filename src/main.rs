//! prox-capture - 125 kHz proximity card reader core
//!
//! Captures demodulator edge timing, decodes EM4100 (ASK/biphase) and
//! HID Prox (FSK/Wiegand) cards, and emits validated card events as
//! JSON lines.

mod config;
mod decode;
mod hw;
mod reader;

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::Config;
use decode::types::CardFormat;
use hw::sim::{SimCounter, SimFrontend};
use reader::{ProxReader, ReaderTiming};

/// Outward card event, one JSON line per accepted read.
#[derive(Debug, Serialize)]
struct CardEvent {
    device_id: String,
    timestamp_ms: u64,
    format: CardFormat,
    code: u64,
    duplicate: bool,
    raw_hex: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   prox-capture - 125 kHz card reader");
    info!("   EM4100 / HID Prox edge-timing decoder");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Device ID: {}", config.device_id);
    info!("  Poll interval: {:?}", config.poll_interval);
    info!("  FSK window: {:?}", config.fsk_window);
    info!("  ASK window: {:?}", config.ask_window);
    if let Some(path) = &config.replay_path {
        info!("  Replay file: {}", path.display());
    }

    // The binary drives the simulated front-end: a replay dump if one is
    // configured, the built-in demo card otherwise.
    let counter = match &config.replay_path {
        Some(path) => SimCounter::from_replay(path)?,
        None => SimCounter::demo_card(),
    };
    let frontend = SimFrontend::new();

    let timing = ReaderTiming {
        fsk_window: config.fsk_window,
        ask_window: config.ask_window,
        poll_interval: config.poll_interval,
    };
    let (handle, mut cards) = ProxReader::new(counter, frontend, timing).start()?;

    info!("===========================================");
    info!("  Polling for cards...");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    let mut stats_tick = tokio::time::interval(config.stats_interval);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cards_seen = 0u64;

    loop {
        tokio::select! {
            maybe_record = cards.recv() => {
                let Some(record) = maybe_record else {
                    warn!("reader channel closed");
                    break;
                };
                cards_seen += 1;

                let event = CardEvent {
                    device_id: config.device_id.clone(),
                    timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
                    format: record.format,
                    code: record.code,
                    duplicate: record.duplicate,
                    raw_hex: record.raw_hex(),
                };
                info!(">>> CARD: {}", serde_json::to_string(&event)?);
            }
            _ = stats_tick.tick() => {
                let capture = &handle.capture_stats;
                let decode = &handle.decode_stats;
                info!(
                    "[Reader Stats] Windows: {} | Edges: {} (dropped: {}) | Attempts: {} | Accepted: {} | Header misses: {} | Parity rejects: {}",
                    capture.windows_opened.load(Ordering::Relaxed),
                    capture.edges_captured.load(Ordering::Relaxed),
                    capture.edges_dropped.load(Ordering::Relaxed),
                    decode.attempts.load(Ordering::Relaxed),
                    decode.frames_accepted.load(Ordering::Relaxed),
                    decode.header_misses.load(Ordering::Relaxed),
                    decode.parity_rejects.load(Ordering::Relaxed),
                );
                if !handle.is_running() {
                    warn!("poll loop stopped unexpectedly");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    handle.stop();
    info!("Shutdown complete. Cards decoded: {}", cards_seen);
    Ok(())
}
