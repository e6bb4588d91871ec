use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jsonschema::validator_for;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::DeviceFamily;
use crate::upgrade::{ProfileOverride, UpgradeTimings};

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Firmware catalog used to resolve `model + version` into a download.
    #[serde(default)]
    pub firmware: Vec<FirmwareEntry>,
    #[serde(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RuntimeConfig {
    /// Directory holding the SQLite store and rolled logs.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Broadcast capacity of the event bus.
    #[serde(default)]
    pub bus_capacity: Option<usize>,
}

impl RuntimeConfig {
    /// `NETFLEET_STATE_DIR` wins over the file value; defaults to `./state`.
    pub fn state_dir(&self) -> PathBuf {
        std::env::var("NETFLEET_STATE_DIR")
            .ok()
            .or_else(|| self.state_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("state"))
    }

    pub fn bus_capacity(&self) -> usize {
        self.bus_capacity.unwrap_or(1024).max(16)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct QueueConfig {
    /// Concurrent firmware upgrades (default 1).
    #[serde(default)]
    pub upgrade_concurrency: Option<usize>,
    /// Delay between startup recovery and resuming dispatch.
    #[serde(default)]
    pub startup_grace_ms: Option<u64>,
    /// How often the daemon looks for tasks submitted by other processes.
    #[serde(default)]
    pub intake_interval_ms: Option<u64>,
}

impl QueueConfig {
    pub fn upgrade_concurrency(&self) -> usize {
        self.upgrade_concurrency.unwrap_or(1).max(1)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms.unwrap_or(5_000))
    }

    pub fn intake_interval(&self) -> Duration {
        Duration::from_millis(self.intake_interval_ms.unwrap_or(2_000).max(100))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct UpgradeConfig {
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub command_retries: Option<u32>,
    #[serde(default)]
    pub command_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_poll_interval_ms: Option<u64>,
    /// Per-family overrides keyed by family name (`edgeOs`, `switch`, `airMax`, `airFiber`, `onu`).
    #[serde(default)]
    pub families: BTreeMap<String, FamilyConfig>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct FamilyConfig {
    #[serde(default)]
    pub expected_duration_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub reconnect_timeout_secs: Option<u64>,
}

impl UpgradeConfig {
    pub fn timings(&self) -> UpgradeTimings {
        let defaults = UpgradeTimings::default();
        UpgradeTimings {
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            command_retries: self.command_retries.unwrap_or(defaults.command_retries),
            command_retry_delay: self
                .command_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_retry_delay),
            reconnect_poll_interval: self
                .reconnect_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_poll_interval),
        }
    }

    pub fn profile_override(&self, family: DeviceFamily) -> ProfileOverride {
        let Some(entry) = self.families.get(family.as_str()) else {
            return ProfileOverride::default();
        };
        ProfileOverride {
            expected_duration: entry.expected_duration_secs.map(Duration::from_secs),
            timeout: entry.timeout_secs.map(Duration::from_secs),
            reconnect_timeout: entry.reconnect_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ReaperConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(60).max(1))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SettingsConfig {
    /// Base URL devices download firmware from (e.g., <https://fleet.example.net/firmwares/>)
    #[serde(default)]
    pub firmware_base_url: Option<String>,
    /// Site-specific base URLs for devices that cannot reach the public one.
    #[serde(default)]
    pub site_base_urls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct FirmwareEntry {
    pub model: String,
    pub version: String,
    /// Absolute URL or path relative to the firmware base URL.
    pub url: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SshConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Extra `-o key=value` options passed to the ssh client.
    #[serde(default)]
    pub options: Vec<String>,
    /// Run on an OLT to flash one ONU; `{onu}` and `{url}` are substituted.
    #[serde(default)]
    pub onu_upgrade_command: Option<String>,
    /// Run on an OLT; prints one JSON report per ONU, with its running firmware when known.
    #[serde(default)]
    pub onu_status_command: Option<String>,
    /// Liveness probe whose output carries the running firmware version.
    #[serde(default)]
    pub probe_command: Option<String>,
    /// Seconds between inventory probes (default 30).
    #[serde(default)]
    pub probe_interval_secs: Option<u64>,
}

impl SshConfig {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("ubnt")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10).max(1))
    }

    pub fn onu_upgrade_command(&self) -> &str {
        self.onu_upgrade_command
            .as_deref()
            .unwrap_or("/usr/sbin/onu-fwupdate --onu {onu} --url {url}")
    }

    pub fn onu_status_command(&self) -> &str {
        self.onu_status_command
            .as_deref()
            .unwrap_or("/usr/sbin/onu-fwupdate --status --json")
    }

    pub fn probe_command(&self) -> &str {
        self.probe_command.as_deref().unwrap_or("cat /etc/version")
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.unwrap_or(30).max(1))
    }
}

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).context("serialize config schema")
}

pub fn write_schema_file(path: &Path) -> Result<()> {
    let schema_json = config_schema_json()?;
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
        .with_context(|| format!("write schema to {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let schema = config_schema_json()?;
    let validator = validator_for(&schema).map_err(|e| anyhow!("invalid config schema: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    for family in cfg.upgrade.families.keys() {
        family
            .parse::<DeviceFamily>()
            .map_err(|e| anyhow!("[upgrade.families]: {e}"))?;
    }
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("load config {}", path.display()))
}
