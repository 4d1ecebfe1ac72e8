use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::collector::InstanceMeta;

/// Top-level configuration for the sweepline collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Application name used for self-registration. Default: "sweepline".
    #[serde(default = "default_name")]
    pub name: String,

    /// Port this collector registers itself under. Default: 6980.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host this collector registers itself under. Empty disables
    /// self-registration. Default: "".
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Target time between sweep starts. Default: 30s.
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    /// Per-request timeout when polling endpoints. Default: 10s.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Directory holding per-sink writer configuration files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Connectors that get a per-protocol collection time histogram.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,

    /// Static seed list of endpoints to poll.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Process memory limits.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Downstream sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,
}

/// One statically configured endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub app_name: String,
    /// Default: "json".
    #[serde(default = "default_connector")]
    pub connector: String,
    /// Cloud instance metadata; rollup sinks skip endpoints without it.
    #[serde(default)]
    pub instance: Option<InstanceMeta>,
}

#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address, ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryConfig {
    /// Resident set size above which a warning is logged. 0 disables the check.
    #[serde(default)]
    pub max_rss_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct SinksConfig {
    /// How often writer configuration files are checked for changes.
    /// Default: 10s.
    #[serde(default = "default_reload_interval", with = "humantime_serde")]
    pub reload_interval: Duration,

    #[serde(default)]
    pub cost_rollup: CostRollupConfig,

    #[serde(default)]
    pub billing: RollupSinkConfig,

    #[serde(default)]
    pub cloud_metrics: RollupSinkConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// Window and channel sizing of a single-snapshot rollup sink.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupSinkConfig {
    /// Rollup window length. Default: 5m.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Bounded channel capacity. Default: 10000.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CostRollupConfig {
    /// Rollup window length. Default: 5m.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Bounded channel capacity. Default: 10000.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Instances per downstream call. Default: 100.
    #[serde(default = "default_max_instances_per_call")]
    pub max_instances_per_call: usize,

    /// File systems per downstream call. Default: 500.
    #[serde(default = "default_max_fs_per_call")]
    pub max_fs_per_call: usize,

    /// How long closed snapshots are kept and resent. Default: 24h.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Where retained snapshots are persisted. Unset keeps them in memory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Inventory service endpoint. Empty disables the inventory sink.
    #[serde(default)]
    pub endpoint: String,

    /// Data center name sent with every request. Required with `endpoint`.
    #[serde(default)]
    pub data_center: String,

    /// Only hosts matching this regex are exported.
    #[serde(default)]
    pub host_regex: Option<String>,

    /// Records buffered per write. Default: 40.
    #[serde(default = "default_inventory_buffer_size")]
    pub buffer_size: usize,

    /// Sleep after draining the queue. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub sleep: Duration,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_inventory_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl InventoryConfig {
    pub fn enabled(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Compiles `host_regex`.
    pub fn host_regex(&self) -> Result<Option<Regex>> {
        self.host_regex
            .as_deref()
            .filter(|re| !re.is_empty())
            .map(|re| Regex::new(re).with_context(|| format!("compiling host_regex {re:?}")))
            .transpose()
    }
}

/// Windows are bucketed by whole epoch seconds.
fn check_window(key: &str, window: Duration) -> Result<()> {
    if window.is_zero() {
        bail!("{key} must be positive");
    }
    if window.subsec_nanos() != 0 {
        bail!("{key} {window:?} must be a whole number of seconds");
    }
    Ok(())
}

// --- Default value functions ---

fn default_name() -> String {
    "sweepline".to_string()
}

fn default_port() -> u16 {
    6980
}

fn default_host_name() -> String {
    String::new()
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/sweepline")
}

fn default_protocols() -> Vec<String> {
    vec!["json".to_string()]
}

fn default_connector() -> String {
    "json".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_max_instances_per_call() -> usize {
    100
}

fn default_max_fs_per_call() -> usize {
    500
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_inventory_buffer_size() -> usize {
    40
}

fn default_inventory_timeout() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            host_name: default_host_name(),
            collection_interval: default_collection_interval(),
            poll_timeout: default_poll_timeout(),
            config_dir: default_config_dir(),
            protocols: default_protocols(),
            endpoints: Vec::new(),
            health: HealthConfig::default(),
            memory: MemoryConfig::default(),
            sinks: SinksConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            reload_interval: default_reload_interval(),
            cost_rollup: CostRollupConfig::default(),
            billing: RollupSinkConfig::default(),
            cloud_metrics: RollupSinkConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

impl Default for RollupSinkConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CostRollupConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            channel_capacity: default_channel_capacity(),
            max_instances_per_call: default_max_instances_per_call(),
            max_fs_per_call: default_max_fs_per_call(),
            retention: default_retention(),
            state_dir: None,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            data_center: String::new(),
            host_regex: None,
            buffer_size: default_inventory_buffer_size(),
            sleep: Duration::ZERO,
            timeout: default_inventory_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("name is required");
        }

        if self.collection_interval.is_zero() {
            bail!("collection_interval must be positive");
        }

        if self.sinks.reload_interval.is_zero() {
            bail!("sinks.reload_interval must be positive");
        }

        let cost = &self.sinks.cost_rollup;
        check_window("sinks.cost_rollup.window", cost.window)?;
        if cost.channel_capacity == 0 {
            bail!("sinks.cost_rollup.channel_capacity must be positive");
        }
        if cost.max_instances_per_call == 0 {
            bail!("sinks.cost_rollup.max_instances_per_call must be at least 1");
        }
        if cost.max_fs_per_call == 0 {
            bail!("sinks.cost_rollup.max_fs_per_call must be at least 1");
        }
        if cost.retention < cost.window {
            bail!(
                "sinks.cost_rollup.retention {:?} must be at least the window {:?}",
                cost.retention,
                cost.window
            );
        }

        for (name, sink) in [
            ("billing", &self.sinks.billing),
            ("cloud_metrics", &self.sinks.cloud_metrics),
        ] {
            check_window(&format!("sinks.{name}.window"), sink.window)?;
            if sink.channel_capacity == 0 {
                bail!("sinks.{name}.channel_capacity must be positive");
            }
        }

        let inventory = &self.sinks.inventory;
        if inventory.enabled() {
            if inventory.data_center.is_empty() {
                bail!("sinks.inventory.data_center is required when sinks.inventory.endpoint is set");
            }
            if inventory.buffer_size == 0 {
                bail!("sinks.inventory.buffer_size must be positive");
            }
            inventory
                .host_regex()
                .context("invalid sinks.inventory.host_regex")?;
        }

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.host.is_empty() {
                bail!("endpoints[{i}].host is required");
            }
            if endpoint.app_name.is_empty() {
                bail!("endpoints[{i}].app_name is required");
            }
            if endpoint
                .instance
                .as_ref()
                .is_some_and(|meta| meta.instance_id.is_empty())
            {
                bail!("endpoints[{i}].instance.instance_id is required");
            }
        }

        Ok(())
    }

    /// Path of a sink's writer configuration file.
    pub fn writer_config_path(&self, sink: &str) -> PathBuf {
        self.config_dir.join(format!("{sink}.yaml"))
    }
}
