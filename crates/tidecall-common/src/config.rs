//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config file > defaults
//!
//! Unlike a process-wide singleton, [`load`] hands back an owned [`AppConfig`];
//! the binary passes the pieces it needs to each component it constructs.

use serde::Deserialize;
use std::path::Path;

/// Load configuration from defaults, an optional config file, and the environment.
///
/// `path` names a config file without extension (e.g. `"config"` for
/// `config.toml`); a missing file is not an error.
pub fn load(path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let file = path
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.signaling_port", 8082)?
        .set_default("logging.filter", "tidecall=debug")?
        .set_default("logging.json", false)?
        // Quality scoring breakpoints
        .set_default("quality.rtt_excellent_ms", 50.0)?
        .set_default("quality.rtt_good_ms", 100.0)?
        .set_default("quality.rtt_poor_ms", 200.0)?
        .set_default("quality.loss_excellent_pct", 1.0)?
        .set_default("quality.loss_good_pct", 3.0)?
        .set_default("quality.loss_poor_pct", 10.0)?
        .set_default("quality.jitter_excellent_ms", 10.0)?
        .set_default("quality.jitter_good_ms", 20.0)?
        .set_default("quality.jitter_poor_ms", 50.0)?
        .set_default("quality.bandwidth_excellent_kbps", 2000.0)?
        .set_default("quality.bandwidth_good_kbps", 1000.0)?
        .set_default("quality.bandwidth_poor_kbps", 500.0)?
        .set_default("quality.signal_excellent_pct", 80.0)?
        .set_default("quality.signal_good_pct", 60.0)?
        .set_default("quality.signal_poor_pct", 40.0)?
        // Fallback policy
        .set_default("fallback.quality_history_capacity", 50)?
        .set_default("fallback.transition_history_capacity", 20)?
        .set_default("fallback.override_rtt_ms", 300.0)?
        .set_default("fallback.override_loss_pct", 15.0)?
        .set_default("fallback.override_bandwidth_kbps", 500.0)?
        .set_default("fallback.override_jitter_ms", 100.0)?
        .set_default("fallback.recovery_rtt_ms", 100.0)?
        .set_default("fallback.recovery_loss_pct", 2.0)?
        .set_default("fallback.recovery_bandwidth_kbps", 1500.0)?
        // Background maintenance
        .set_default("cleanup.interval_secs", 60)?
        .set_default("cleanup.history_retention_secs", 600)?
        .set_default("cleanup.idle_call_timeout_secs", 3600)?
        // Signaling
        .set_default("signaling.outbound_buffer", 256)?
        .set_default(
            "signaling.ice_servers",
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        )?
        // Optional config file
        .add_source(config::File::with_name(&file).required(false))
        // Environment variables (TIDECALL__SERVER__HOST, TIDECALL__FALLBACK__OVERRIDE_RTT_MS, etc.)
        .add_source(
            config::Environment::with_prefix("TIDECALL")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("signaling.ice_servers"),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub quality: QualityConfig,
    pub fallback: FallbackConfig,
    pub cleanup: CleanupConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port for the call signaling WebSocket.
    pub signaling_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Breakpoints of the piecewise-linear network quality sub-scores.
///
/// Lower-is-better metrics (RTT, loss, jitter) score 100 at or below the
/// excellent breakpoint; higher-is-better metrics (bandwidth, signal) score
/// 100 at or above it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QualityConfig {
    pub rtt_excellent_ms: f64,
    pub rtt_good_ms: f64,
    pub rtt_poor_ms: f64,
    pub loss_excellent_pct: f64,
    pub loss_good_pct: f64,
    pub loss_poor_pct: f64,
    pub jitter_excellent_ms: f64,
    pub jitter_good_ms: f64,
    pub jitter_poor_ms: f64,
    pub bandwidth_excellent_kbps: f64,
    pub bandwidth_good_kbps: f64,
    pub bandwidth_poor_kbps: f64,
    pub signal_excellent_pct: f64,
    pub signal_good_pct: f64,
    pub signal_poor_pct: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            rtt_excellent_ms: 50.0,
            rtt_good_ms: 100.0,
            rtt_poor_ms: 200.0,
            loss_excellent_pct: 1.0,
            loss_good_pct: 3.0,
            loss_poor_pct: 10.0,
            jitter_excellent_ms: 10.0,
            jitter_good_ms: 20.0,
            jitter_poor_ms: 50.0,
            bandwidth_excellent_kbps: 2000.0,
            bandwidth_good_kbps: 1000.0,
            bandwidth_poor_kbps: 500.0,
            signal_excellent_pct: 80.0,
            signal_good_pct: 60.0,
            signal_poor_pct: 40.0,
        }
    }
}

/// Downgrade overrides, recovery gates, and history bounds for call fallback.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FallbackConfig {
    pub quality_history_capacity: usize,
    pub transition_history_capacity: usize,
    /// RTT above this forces at least audio-only.
    pub override_rtt_ms: f64,
    /// Packet loss above this forces at least very-low quality.
    pub override_loss_pct: f64,
    /// Bandwidth below this forces at least low quality.
    pub override_bandwidth_kbps: f64,
    /// Jitter above this forces at least low quality.
    pub override_jitter_ms: f64,
    pub recovery_rtt_ms: f64,
    pub recovery_loss_pct: f64,
    pub recovery_bandwidth_kbps: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            quality_history_capacity: 50,
            transition_history_capacity: 20,
            override_rtt_ms: 300.0,
            override_loss_pct: 15.0,
            override_bandwidth_kbps: 500.0,
            override_jitter_ms: 100.0,
            recovery_rtt_ms: 100.0,
            recovery_loss_pct: 2.0,
            recovery_bandwidth_kbps: 1500.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Seconds between maintenance passes.
    pub interval_secs: u64,
    /// Quality snapshots and transitions older than this are pruned.
    pub history_retention_secs: u64,
    /// Calls with no activity for this long are ended.
    pub idle_call_timeout_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            history_retention_secs: 600,
            idle_call_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Depth of each peer's outbound signal channel.
    pub outbound_buffer: usize,
    /// STUN/TURN URLs handed to clients when they join a call.
    pub ice_servers: Vec<String>,
}
