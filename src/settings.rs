//! Runtime configuration resolved from environment variables.
//!
//! Every knob has a default so the proxy starts with no configuration at all;
//! malformed values fall back to the default with a warning rather than
//! aborting startup.

use std::env;
use std::time::Duration;

/// Process-wide settings, read once at startup and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP listen address.
    pub bind_addr: String,
    /// SQLite database path.
    pub db_path: String,
    /// Deadline for a full instance startup (spawn/connect + handshake + discovery).
    pub instance_startup_timeout: Duration,
    /// Health monitor cycle interval.
    pub health_interval: Duration,
    /// Per-ping deadline inside a health cycle.
    pub health_ping_timeout: Duration,
    /// Consecutive ping failures before a service is marked unhealthy.
    pub health_fail_threshold: u32,
    /// Startup synchronizer resync interval.
    pub resync_interval: Duration,
    /// Bounded capacity of the request-stat accounting queue.
    pub stat_queue_size: usize,
    /// Whether requests without a resolvable identity are admitted.
    pub allow_anonymous: bool,
    /// When set, fern also writes a log file in this directory.
    pub log_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7077".to_string(),
            db_path: "one-mcp.db".to_string(),
            instance_startup_timeout: Duration::from_secs(60),
            health_interval: Duration::from_secs(60),
            health_ping_timeout: Duration::from_secs(5),
            health_fail_threshold: 3,
            resync_interval: Duration::from_secs(60),
            stat_queue_size: 10_000,
            allow_anonymous: false,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Builds settings from the `PROXY_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            bind_addr: env_string("PROXY_BIND_ADDR", &defaults.bind_addr),
            db_path: env_string("PROXY_DB_PATH", &defaults.db_path),
            instance_startup_timeout: env_secs("PROXY_INSTANCE_STARTUP_TIMEOUT_S", 60),
            health_interval: env_secs("PROXY_HEALTH_INTERVAL_S", 60),
            health_ping_timeout: env_secs("PROXY_HEALTH_PING_TIMEOUT_S", 5),
            health_fail_threshold: env_parse("PROXY_HEALTH_FAIL_THRESHOLD", 3u32),
            resync_interval: env_secs("PROXY_RESYNC_INTERVAL_S", 60),
            stat_queue_size: env_parse("PROXY_STAT_QUEUE_SIZE", 10_000usize),
            allow_anonymous: env_parse("PROXY_ALLOW_ANONYMOUS", false),
            log_dir: env::var("PROXY_LOG_DIR").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
