//! Process configuration for both binaries: a `Config` struct deserialized
//! from JSON5, loaded the way the teacher's `turn-server` loads its own
//! (`clap` parses a `--config <path>` flag, the file is read and parsed),
//! with nested structs carrying per-field defaults so every key is optional.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;

use rtp_core::nada;

#[derive(Parser)]
#[command(name = "rtp-relay", about = "A pure rust-implemented multi-path RTP/RTCP relay and sender.")]
struct Cli {
    /// Path to a JSON5 config file. Missing keys fall back to their default.
    #[arg(long)]
    config: Option<String>,
}

/// The relay binary's listen socket.
#[derive(Deserialize, Debug, Clone)]
pub struct Relay {
    #[serde(default = "Relay::default_listen")]
    pub listen: SocketAddr,
}

impl Relay {
    fn default_listen() -> SocketAddr {
        "0.0.0.0:5000".parse().unwrap()
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

/// The sender binary's remote relay address, local CNAME, and the
/// name-prefix filter it polls host interfaces with.
#[derive(Deserialize, Debug, Clone)]
pub struct Sender {
    #[serde(default = "Sender::default_remote")]
    pub remote: SocketAddr,
    #[serde(default = "Sender::default_cname")]
    pub cname: String,
    #[serde(default = "Sender::default_interface_prefixes")]
    pub interface_prefixes: Vec<String>,
}

impl Sender {
    fn default_remote() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn default_cname() -> String {
        "default".to_string()
    }

    fn default_interface_prefixes() -> Vec<String> {
        vec!["usb".to_string(), "wlan".to_string(), "eth".to_string()]
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self {
            remote: Self::default_remote(),
            cname: Self::default_cname(),
            interface_prefixes: Self::default_interface_prefixes(),
        }
    }
}

/// Per-stage delays of the composite jitter pipeline, and the coalescing
/// NACK interval the funnel flushes on.
#[derive(Deserialize, Debug, Clone)]
pub struct Jitter {
    #[serde(default = "Jitter::default_stage_delays_ms")]
    pub stage_delays_ms: Vec<u64>,
    #[serde(default = "Jitter::default_nack_interval_ms")]
    pub nack_interval_ms: u64,
}

impl Jitter {
    fn default_stage_delays_ms() -> Vec<u64> {
        vec![120, 240, 360]
    }

    fn default_nack_interval_ms() -> u64 {
        150
    }

    pub fn stage_delays(&self) -> Vec<Duration> {
        self.stage_delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    pub fn nack_interval(&self) -> Duration {
        Duration::from_millis(self.nack_interval_ms)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self {
            stage_delays_ms: Self::default_stage_delays_ms(),
            nack_interval_ms: Self::default_nack_interval_ms(),
        }
    }
}

/// Deployment-tunable overrides layered onto [`nada::Config::default`];
/// every other NADA constant stays at its tuned default (`spec.md` §9's
/// resolved Open Question), since only the rate bounds and path priority
/// are the kind of knob a deployment plausibly wants to change per link.
#[derive(Deserialize, Debug, Clone)]
pub struct Nada {
    #[serde(default = "Nada::default_min_rate_bps")]
    pub min_rate_bps: u64,
    #[serde(default = "Nada::default_max_rate_bps")]
    pub max_rate_bps: u64,
    #[serde(default = "Nada::default_priority")]
    pub priority: f64,
}

impl Nada {
    fn default_min_rate_bps() -> u64 {
        nada::Config::default().min_rate_bps
    }

    fn default_max_rate_bps() -> u64 {
        nada::Config::default().max_rate_bps
    }

    fn default_priority() -> f64 {
        nada::Config::default().priority
    }

    pub fn to_nada_config(&self) -> nada::Config {
        nada::Config {
            min_rate_bps: self.min_rate_bps,
            max_rate_bps: self.max_rate_bps,
            priority: self.priority,
            ..nada::Config::default()
        }
    }
}

impl Default for Nada {
    fn default() -> Self {
        Self {
            min_rate_bps: Self::default_min_rate_bps(),
            max_rate_bps: Self::default_max_rate_bps(),
            priority: Self::default_priority(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// The `axum`-served metrics endpoint (`spec.md` §9.3); `None` disables it
/// entirely.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Metrics {
    pub listen: Option<SocketAddr>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub jitter: Jitter,
    #[serde(default)]
    pub nada: Nada,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Config {
    /// Parses `--config <path>` and loads it, or falls back to an
    /// all-defaults config if no path was given.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let raw = match cli.config {
            Some(path) => std::fs::read_to_string(&path)
                .map_err(|err| anyhow::anyhow!("failed to read config file {path}: {err}"))?,
            None => "{}".to_string(),
        };

        Ok(serde_json5::from_str(&raw)?)
    }
}
