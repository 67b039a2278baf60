use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the httpmon agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often to sweep every CPU's current page for pending
    /// transactions. Default: 500ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often to purge idle in-flight entries from the kernel map.
    /// Default: 300s.
    #[serde(default = "default_map_cleaner_interval", with = "humantime_serde")]
    pub map_cleaner_interval: Duration,

    /// Age after which an incomplete in-flight transaction is purged.
    /// Default: 30s.
    #[serde(default = "default_idle_connection_ttl", with = "humantime_serde")]
    pub idle_connection_ttl: Duration,

    /// How often to log the telemetry rate summary. Default: 30s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Maximum number of endpoint keys held between stat flushes; further
    /// keys are dropped (and counted). Default: 100000.
    #[serde(default = "default_max_aggregation_entries")]
    pub max_aggregation_entries: usize,

    /// Request-path prefixes to exclude from aggregation.
    #[serde(default)]
    pub reject_path_prefixes: Vec<String>,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Kernel probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Kernel probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Path to the compiled BPF object implementing the capture probe.
    #[serde(default)]
    pub object_path: PathBuf,

    /// Per-CPU perf buffer size for notifications, in pages. Must be a
    /// power of two. Default: 8.
    #[serde(default = "default_perf_buffer_pages")]
    pub perf_buffer_pages: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_map_cleaner_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_idle_connection_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_aggregation_entries() -> usize {
    100_000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_perf_buffer_pages() -> usize {
    8
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll_interval: default_poll_interval(),
            map_cleaner_interval: default_map_cleaner_interval(),
            idle_connection_ttl: default_idle_connection_ttl(),
            report_interval: default_report_interval(),
            max_aggregation_entries: default_max_aggregation_entries(),
            reject_path_prefixes: Vec::new(),
            health: HealthConfig::default(),
            probe: ProbeConfig::default(),
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

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::new(),
            perf_buffer_pages: default_perf_buffer_pages(),
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
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.map_cleaner_interval.is_zero() {
            bail!("map_cleaner_interval must be positive");
        }

        if self.idle_connection_ttl.is_zero() {
            bail!("idle_connection_ttl must be positive");
        }

        if self.report_interval.is_zero() {
            bail!("report_interval must be positive");
        }

        if self.max_aggregation_entries == 0 {
            bail!("max_aggregation_entries must be positive");
        }

        if !self.probe.perf_buffer_pages.is_power_of_two() {
            bail!(
                "probe.perf_buffer_pages must be a power of two, got {}",
                self.probe.perf_buffer_pages
            );
        }

        Ok(())
    }
}
