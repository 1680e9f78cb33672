use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::WindowClock;
use crate::store::schema::Family;

/// Top-level configuration for the shardlens reader.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Root directory the metrics writer buckets its files under.
    #[serde(default)]
    pub metrics_root: PathBuf,

    /// Reader cycle cadence and window width. Default: 5s.
    #[serde(default = "default_cadence", with = "humantime_serde")]
    pub cadence: Duration,

    /// Writer bucket rotation interval. Default: 5s.
    #[serde(default = "default_rotation_interval", with = "humantime_serde")]
    pub rotation_interval: Duration,

    /// Retention bounds for snapshots and output buckets.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Output store configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Node-level families to track. Default: all of them.
    #[serde(default = "default_families")]
    pub families: Vec<Family>,

    /// Development diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Writer bucket janitor.
    #[serde(default)]
    pub janitor: JanitorConfig,

    /// Cluster topology feed.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Retention bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Raw snapshots kept per family. Default: 4.
    #[serde(default = "default_retained_snapshots")]
    pub snapshots: usize,

    /// Output buckets kept on disk. Default: 4.
    #[serde(default = "default_retained_output_buckets")]
    pub output_buckets: usize,

    /// In-flight requests older than this are no longer rolled over.
    /// Default: 10m.
    #[serde(default = "default_rollover_expiry", with = "humantime_serde")]
    pub rollover_expiry: Duration,
}

/// Output store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Directory holding `metricsdb_<key>` buckets.
    #[serde(default)]
    pub dir: PathBuf,
}

/// Development diagnostics.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagnosticsConfig {
    /// Cross-check request threads against OS thread samples.
    #[serde(default)]
    pub thread_consistency_check: bool,

    /// Abort the pipeline on a cross-check violation instead of warning.
    #[serde(default)]
    pub fail_on_inconsistency: bool,
}

/// Writer bucket janitor.
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    /// Delete writer buckets older than `horizon`. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Age after which a writer bucket is deleted. Default: 10m.
    #[serde(default = "default_janitor_horizon", with = "humantime_serde")]
    pub horizon: Duration,
}

/// Cluster topology feed.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// JSON file listing cluster nodes. Disabled when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How often the file is reloaded. Default: 60s.
    #[serde(default = "default_topology_refresh", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cadence() -> Duration {
    Duration::from_secs(5)
}

fn default_rotation_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retained_snapshots() -> usize {
    4
}

fn default_retained_output_buckets() -> usize {
    4
}

fn default_rollover_expiry() -> Duration {
    Duration::from_secs(600)
}

fn default_families() -> Vec<Family> {
    Family::NODE.to_vec()
}

fn default_janitor_horizon() -> Duration {
    Duration::from_secs(600)
}

fn default_topology_refresh() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9091".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_root: PathBuf::new(),
            cadence: default_cadence(),
            rotation_interval: default_rotation_interval(),
            retention: RetentionConfig::default(),
            output: OutputConfig::default(),
            families: default_families(),
            diagnostics: DiagnosticsConfig::default(),
            janitor: JanitorConfig::default(),
            topology: TopologyConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            snapshots: default_retained_snapshots(),
            output_buckets: default_retained_output_buckets(),
            rollover_expiry: default_rollover_expiry(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            horizon: default_janitor_horizon(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            path: None,
            refresh_interval: default_topology_refresh(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

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
        if self.metrics_root.as_os_str().is_empty() {
            bail!("metrics_root is required");
        }

        if self.output.dir.as_os_str().is_empty() {
            bail!("output.dir is required");
        }

        if self.cadence < Duration::from_millis(1) {
            bail!("cadence must be at least 1ms");
        }

        if self.cadence.subsec_nanos() % 1_000_000 != 0 {
            bail!("cadence must be a whole number of milliseconds");
        }

        if self.rotation_interval < Duration::from_millis(1) {
            bail!("rotation_interval must be at least 1ms");
        }

        if self.rotation_interval.subsec_nanos() % 1_000_000 != 0 {
            bail!("rotation_interval must be a whole number of milliseconds");
        }

        if self.retention.snapshots < 2 {
            bail!("retention.snapshots must be at least 2");
        }

        if self.retention.output_buckets == 0 {
            bail!("retention.output_buckets must be at least 1");
        }

        if self.retention.rollover_expiry < self.cadence {
            bail!("retention.rollover_expiry must be at least one cadence");
        }

        let mut seen = BTreeSet::new();
        for family in &self.families {
            if !Family::NODE.contains(family) {
                bail!("families: {family} is not a node-level family");
            }
            if !seen.insert(*family) {
                bail!("families: {family} listed more than once");
            }
        }

        if self.diagnostics.fail_on_inconsistency && !self.diagnostics.thread_consistency_check {
            bail!("diagnostics.fail_on_inconsistency requires diagnostics.thread_consistency_check");
        }

        if self.janitor.enabled {
            let kept = self.cadence * u32::try_from(self.retention.snapshots).unwrap_or(u32::MAX);
            if self.janitor.horizon <= kept {
                bail!("janitor.horizon must exceed retention.snapshots x cadence ({kept:?})");
            }
        }

        if self.topology.path.is_some() && self.topology.refresh_interval.is_zero() {
            bail!("topology.refresh_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }

    /// Reader clock built from `cadence` and `rotation_interval`.
    pub fn clock(&self) -> Result<WindowClock> {
        WindowClock::new(self.cadence, self.rotation_interval)
    }

    /// Effective log filter: the command-line override if given, otherwise
    /// `log_level` from the file.
    pub fn log_filter<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.unwrap_or(&self.log_level)
    }

    /// Node families to track, in a stable order.
    pub fn node_families(&self) -> Vec<Family> {
        let set: BTreeSet<Family> = self.families.iter().copied().collect();
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            metrics_root: PathBuf::from("/dev/shm/performanceanalyzer"),
            output: OutputConfig {
                dir: PathBuf::from("/tmp/shardlens"),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.cadence, Duration::from_secs(5));
        assert_eq!(cfg.rotation_interval, Duration::from_secs(5));
        assert_eq!(cfg.retention.snapshots, 4);
        assert_eq!(cfg.retention.output_buckets, 4);
        assert_eq!(cfg.families.len(), 5);
        assert_eq!(cfg.health.addr, ":9091");
        assert!(cfg.health.enabled);
        assert!(!cfg.janitor.enabled);
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_yaml_parsing_with_durations() {
        let yaml = r#"
metrics_root: /dev/shm/pa
cadence: 10s
rotation_interval: 30s
retention:
  snapshots: 6
  rollover_expiry: 5m
output:
  dir: /var/lib/shardlens
families: [disk, heap]
diagnostics:
  thread_consistency_check: true
topology:
  path: /etc/shardlens/nodes.json
  refresh_interval: 2m
health:
  addr: "127.0.0.1:9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("valid");

        assert_eq!(cfg.cadence, Duration::from_secs(10));
        assert_eq!(cfg.rotation_interval, Duration::from_secs(30));
        assert_eq!(cfg.retention.snapshots, 6);
        assert_eq!(cfg.retention.output_buckets, 4);
        assert_eq!(cfg.retention.rollover_expiry, Duration::from_secs(300));
        assert_eq!(cfg.node_families(), vec![Family::Disk, Family::Heap]);
        assert!(cfg.diagnostics.thread_consistency_check);
        assert_eq!(cfg.topology.refresh_interval, Duration::from_secs(120));
        assert_eq!(cfg.health.addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_log_level_from_file_unless_overridden() {
        let yaml = r#"
log_level: "debug,shardlens::parser=trace"
metrics_root: /dev/shm/pa
output:
  dir: /var/lib/shardlens
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.log_filter(None), "debug,shardlens::parser=trace");
        assert_eq!(cfg.log_filter(Some("warn")), "warn");
        assert_eq!(Config::default().log_filter(None), "info");
    }

    #[test]
    fn test_validate_requires_paths() {
        let mut cfg = valid_config();
        cfg.metrics_root = PathBuf::new();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("metrics_root"));

        let mut cfg = valid_config();
        cfg.output.dir = PathBuf::new();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("output.dir"));
    }

    #[test]
    fn test_validate_rejects_zero_cadence() {
        let mut cfg = valid_config();
        cfg.cadence = Duration::ZERO;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("cadence"));

        let mut cfg = valid_config();
        cfg.rotation_interval = Duration::from_micros(1_500);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("rotation_interval"));
    }

    #[test]
    fn test_validate_rejects_small_retention() {
        let mut cfg = valid_config();
        cfg.retention.snapshots = 1;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("retention.snapshots"));

        let mut cfg = valid_config();
        cfg.retention.output_buckets = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_request_family_in_families() {
        let mut cfg = valid_config();
        cfg.families = vec![Family::Disk, Family::ShardRequests];
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("not a node-level family"));

        let mut cfg = valid_config();
        cfg.families = vec![Family::Disk, Family::Disk];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_janitor_horizon_must_exceed_retention() {
        let mut cfg = valid_config();
        cfg.janitor.enabled = true;
        cfg.janitor.horizon = Duration::from_secs(20);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("janitor.horizon"));

        cfg.janitor.horizon = Duration::from_secs(21);
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_validate_fail_on_inconsistency_requires_check() {
        let mut cfg = valid_config();
        cfg.diagnostics.fail_on_inconsistency = true;
        assert!(cfg.validate().is_err());

        cfg.diagnostics.thread_consistency_check = true;
        cfg.validate().expect("valid");
    }
}
