//! Bridge settings – reads/writes `~/.mtwlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mtwlink_hal::QueuePolicy;
use mtwlink_runtime::{BridgeLoopConfig, SessionConfig, WaitStrategy};
use mtwlink_types::BridgeError;
use serde::{Deserialize, Serialize};

/// How the streaming loop idles between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Sleep until a sensor pushes, bounded by `park_timeout_ms`.
    #[default]
    Park,
    /// Spin with a zero-length yield.
    Busy,
}

/// Persisted settings stored in `~/.mtwlink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Update rate (Hz) to approximate; the closest supported rate is used.
    #[serde(default = "default_update_rate")]
    pub desired_update_rate: u32,

    /// Radio channel for the wireless master (11–25).
    #[serde(default = "default_radio_channel")]
    pub radio_channel: u8,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_stream_type")]
    pub stream_type: String,

    /// Rows per published chunk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records between summary log blocks (`0` disables them).
    #[serde(default = "default_summary_every")]
    pub summary_every: u64,

    #[serde(default)]
    pub wait_strategy: WaitMode,

    #[serde(default = "default_park_timeout_ms")]
    pub park_timeout_ms: u64,

    /// Samples buffered per sensor before the oldest are dropped.
    /// `0` keeps every sample.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of sensors on the simulated network.
    #[serde(default = "default_sim_sensors")]
    pub sim_sensors: usize,

    /// Write chunks as JSON lines to this file instead of the in-process
    /// stream outlet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

fn default_update_rate() -> u32 {
    mtwlink_runtime::session::DEFAULT_UPDATE_RATE
}
fn default_radio_channel() -> u8 {
    mtwlink_runtime::session::DEFAULT_RADIO_CHANNEL
}
fn default_stream_name() -> String {
    mtwlink_runtime::session::DEFAULT_STREAM_NAME.to_string()
}
fn default_stream_type() -> String {
    mtwlink_runtime::session::DEFAULT_STREAM_TYPE.to_string()
}
fn default_batch_size() -> usize {
    mtwlink_runtime::bridge_loop::DEFAULT_BATCH_SIZE
}
fn default_summary_every() -> u64 {
    mtwlink_runtime::bridge_loop::DEFAULT_SUMMARY_EVERY
}
fn default_park_timeout_ms() -> u64 {
    1
}
fn default_queue_capacity() -> usize {
    mtwlink_hal::packet_queue::DEFAULT_QUEUE_CAPACITY
}
fn default_sim_sensors() -> usize {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desired_update_rate: default_update_rate(),
            radio_channel: default_radio_channel(),
            stream_name: default_stream_name(),
            stream_type: default_stream_type(),
            batch_size: default_batch_size(),
            summary_every: default_summary_every(),
            wait_strategy: WaitMode::default(),
            park_timeout_ms: default_park_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            sim_sensors: default_sim_sensors(),
            output_path: None,
        }
    }
}

impl Config {
    /// Reject values no base station would accept.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !(11..=25).contains(&self.radio_channel) {
            return Err(BridgeError::Config(format!(
                "radio_channel {} is outside 11..=25",
                self.radio_channel
            )));
        }
        if self.batch_size == 0 {
            return Err(BridgeError::Config("batch_size must be at least 1".into()));
        }
        if self.desired_update_rate == 0 {
            return Err(BridgeError::Config(
                "desired_update_rate must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        let wait = match self.wait_strategy {
            WaitMode::Park => WaitStrategy::Park {
                timeout: Duration::from_millis(self.park_timeout_ms),
            },
            WaitMode::Busy => WaitStrategy::BusyYield,
        };
        SessionConfig {
            desired_update_rate: self.desired_update_rate,
            radio_channel: self.radio_channel,
            stream_name: self.stream_name.clone(),
            stream_type: self.stream_type.clone(),
            queue_policy: QueuePolicy::from_capacity(self.queue_capacity),
            loop_config: BridgeLoopConfig {
                batch_size: self.batch_size,
                summary_every: self.summary_every,
                wait,
            },
            ..SessionConfig::default()
        }
    }
}

/// Return the path to `~/.mtwlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mtwlink").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, BridgeError> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `MTWLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MTWLINK_UPDATE_RATE` | `desired_update_rate` |
/// | `MTWLINK_RADIO_CHANNEL` | `radio_channel` |
/// | `MTWLINK_STREAM_NAME` | `stream_name` |
/// | `MTWLINK_SIM_SENSORS` | `sim_sensors` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MTWLINK_UPDATE_RATE")
        && let Ok(rate) = v.trim().parse()
    {
        cfg.desired_update_rate = rate;
    }
    if let Ok(v) = std::env::var("MTWLINK_RADIO_CHANNEL")
        && let Ok(channel) = v.trim().parse()
    {
        cfg.radio_channel = channel;
    }
    if let Ok(v) = std::env::var("MTWLINK_STREAM_NAME") {
        cfg.stream_name = v;
    }
    if let Ok(v) = std::env::var("MTWLINK_SIM_SENSORS")
        && let Ok(n) = v.trim().parse()
    {
        cfg.sim_sensors = n;
    }
}

/// Save the config to disk, creating `~/.mtwlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), BridgeError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| BridgeError::Config(format!("failed to write {}: {e}", path.display())))
}
