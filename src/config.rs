//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Reader ID string for identification in card events
    pub device_id: String,

    /// Delay between poll cycles in milliseconds
    pub poll_interval: Duration,

    /// FSK capture window duration in milliseconds
    pub fsk_window: Duration,

    /// ASK capture window duration in milliseconds
    pub ask_window: Duration,

    /// Stats reporting interval in seconds
    pub stats_interval: Duration,

    /// Tick dump replayed by the simulated front-end instead of the
    /// built-in demo card
    pub replay_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            device_id: std::env::var("DEVICE_ID").unwrap_or_else(|_| "PROX-0".to_string()),

            poll_interval: Duration::from_millis(env_u64("POLL_INTERVAL_MS", 250)),

            fsk_window: Duration::from_millis(env_u64("FSK_WINDOW_MS", 100)),

            ask_window: Duration::from_millis(env_u64("ASK_WINDOW_MS", 250)),

            stats_interval: Duration::from_secs(env_u64("STATS_INTERVAL_SECS", 5)),

            replay_path: std::env::var("REPLAY_PATH").ok().map(PathBuf::from),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
