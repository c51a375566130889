//! Application configuration.

use crate::error::{AppError, AppResult};
use rotor_broker::{BrokerConfig, BrokerKind, RotationConfig};
use rotor_executor::ExecutorConfig;
use rotor_gateway::ConnectionConfig;
use rotor_risk::RiskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration.
///
/// Loaded once at startup from a TOML file and treated as immutable for
/// the session. Every section falls back to its defaults when absent,
/// so an empty file is a valid (simulated, local-gateway) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the trade-history and equity-curve logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// JSON Lines file the external signal engine appends to.
    #[serde(default = "default_signal_file")]
    pub signal_file: String,
    /// Signal feed poll cadence (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Gateway connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Broker facade settings, including the live/simulated choice.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Pre-trade risk thresholds.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order lifecycle timeouts.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Rotation instrument mapping.
    #[serde(default)]
    pub rotation: RotationConfig,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_signal_file() -> String {
    "./data/signals.jsonl".to_string()
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            signal_file: default_signal_file(),
            poll_interval_ms: default_poll_interval_ms(),
            connection: ConnectionConfig::default(),
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            executor: ExecutorConfig::default(),
            rotation: RotationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &str) -> AppResult<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(path = %path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Force the simulated broker, used by the `--dry-run` flag.
    pub fn force_dry_run(&mut self) {
        self.broker.kind = BrokerKind::Simulated;
    }

    /// Whether the session trades against a real gateway.
    pub fn is_live(&self) -> bool {
        self.broker.kind == BrokerKind::Live
    }
}
