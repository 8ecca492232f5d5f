//! Configuration file support for the WSPR aggregator.
//!
//! Loads settings from YAML, by default `~/.config/wspr-aggregator/config.yaml`
//! on Linux (or the platform-appropriate location on other OSes). The file is
//! read once at startup; changes take effect on restart.
//!
//! ```yaml
//! receiver:
//!   callsign: N0CALL
//!   locator: FN42
//! mqtt:
//!   broker: tcp://localhost:1883
//!   qos: 0
//!   instances:
//!     - name: kiwi-a
//!       topic_prefix: kiwi/a
//! dry_run: false
//! persistence_file: wspr_stats.json
//! web_port: 8080
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::grid::is_valid_grid;

/// Default PSKReporter collector.
pub const PSKREPORTER_HOST: &str = "report.pskreporter.info";

/// Default PSKReporter collector port.
pub const PSKREPORTER_PORT: u16 = 4739;

/// Default WSPRNet submission endpoint.
pub const WSPRNET_URL: &str = "http://wsprnet.org/post/";

/// The station doing the receiving.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Callsign used in every outbound report.
    pub callsign: String,

    /// Receiver Maidenhead locator.
    pub locator: String,
}

/// One receiver instance publishing spots to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance name; spots are tagged with it.
    pub name: String,

    /// Unique MQTT topic prefix; the subscription is `{prefix}/wspr/spot`.
    pub topic_prefix: String,
}

impl InstanceConfig {
    /// The topic this instance publishes spots on.
    pub fn spot_topic(&self) -> String {
        format!("{}/wspr/spot", self.topic_prefix.trim_end_matches('/'))
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URI, e.g. `tcp://localhost:1883`.
    pub broker: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Subscription QoS (0-2).
    pub qos: u8,

    /// MQTT client identifier.
    pub client_id: String,

    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,

    /// Receiver instances to subscribe to.
    pub instances: Vec<InstanceConfig>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            username: None,
            password: None,
            qos: 0,
            client_id: "wspr-aggregator".to_string(),
            keep_alive_secs: 30,
            instances: Vec::new(),
        }
    }
}

/// Window aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Seconds a window stays open after its cycle ends.
    pub grace_secs: u64,

    /// Capacity of the ingest channel between MQTT and the aggregator.
    pub queue_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            grace_secs: 20,
            queue_size: 10_000,
        }
    }
}

/// WSPRNet submission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsprNetConfig {
    pub enabled: bool,

    /// Submission endpoint.
    pub url: String,

    /// Number of concurrent submission workers.
    pub workers: usize,

    /// Capacity of the submission queue.
    pub queue_size: usize,

    /// Retries after the first failed attempt.
    pub max_retries: u32,
}

impl Default for WsprNetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: WSPRNET_URL.to_string(),
            workers: 4,
            queue_size: 1000,
            max_retries: 3,
        }
    }
}

/// PSKReporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PskReporterConfig {
    pub enabled: bool,

    pub host: String,

    pub port: u16,

    /// Antenna description sent in the receiver record.
    pub antenna: String,
}

impl Default for PskReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: PSKREPORTER_HOST.to_string(),
            port: PSKREPORTER_PORT,
            antenna: String::new(),
        }
    }
}

/// Statistics timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between snapshots to `persistence_file`.
    pub save_interval_secs: u64,

    /// Seconds between 24-hour retention passes.
    pub prune_interval_secs: u64,

    /// Seconds between console summaries (0 disables).
    pub summary_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            save_interval_secs: 300,
            prune_interval_secs: 600,
            summary_interval_secs: 600,
        }
    }
}

/// Application configuration loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub receiver: ReceiverConfig,

    pub mqtt: MqttConfig,

    /// Skip all external submissions, counting them as simulated successes.
    pub dry_run: bool,

    /// Path of the JSON statistics snapshot.
    pub persistence_file: PathBuf,

    /// Port for the status/metrics HTTP server (0 disables).
    pub web_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub aggregator: AggregatorConfig,

    pub wsprnet: WsprNetConfig,

    pub pskreporter: PskReporterConfig,

    pub stats: StatsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            mqtt: MqttConfig::default(),
            dry_run: false,
            persistence_file: PathBuf::from("wspr_stats.json"),
            web_port: 8080,
            log_level: "info".to_string(),
            aggregator: AggregatorConfig::default(),
            wsprnet: WsprNetConfig::default(),
            pskreporter: PskReporterConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist. The default location falls back to the
    /// built-in defaults when absent (which then fail validation on the
    /// empty callsign).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => Ok(Config::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid YAML in config file: {}", path.display()))
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Returns the path to the default config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("wspr-aggregator/config.yaml"))
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<(), Error> {
        let callsign = self.receiver.callsign.trim();
        if callsign.is_empty() {
            return Err(Error::ConfigInvalid("receiver.callsign is empty".into()));
        }
        if callsign != self.receiver.callsign {
            return Err(Error::ConfigInvalid(format!(
                "receiver.callsign '{}' has surrounding whitespace",
                self.receiver.callsign
            )));
        }

        if !is_valid_grid(&self.receiver.locator) {
            return Err(Error::ConfigInvalid(format!(
                "receiver.locator '{}' is not a valid Maidenhead locator",
                self.receiver.locator
            )));
        }

        if self.mqtt.qos > 2 {
            return Err(Error::ConfigInvalid(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }

        if self.mqtt.instances.is_empty() {
            return Err(Error::ConfigInvalid(
                "mqtt.instances must list at least one instance".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut topics = HashSet::new();
        for (i, instance) in self.mqtt.instances.iter().enumerate() {
            if instance.name.trim().is_empty() || instance.topic_prefix.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "mqtt.instances[{}] needs a name and a topic_prefix",
                    i
                )));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate instance name '{}'",
                    instance.name
                )));
            }
            if !topics.insert(instance.spot_topic()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate topic prefix '{}'",
                    instance.topic_prefix
                )));
            }
        }

        if self.wsprnet.workers == 0 {
            return Err(Error::ConfigInvalid("wsprnet.workers must be > 0".into()));
        }

        Ok(())
    }
}
