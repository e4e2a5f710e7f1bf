//! Tracer configuration
//!
//! Loaded from an optional YAML file; command line flags are applied on top
//! by the CLI before [`Config::validate`] runs.

use crate::metrics::MetricKind;
use crate::process::TargetSelector;
use crate::session::HelperSpec;
use crate::{Result, TracerError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_OUTPUT_DIR: &str = "records";
pub const DEFAULT_PROBE_OBJECT: &str = "/usr/lib/proctrace/packet_probe";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: Option<TargetSelector>,
    pub output_dir: PathBuf,
    pub sample_interval_ms: u64,
    pub metrics: Vec<MetricKind>,
    pub network: Option<NetworkConfig>,
    pub discovery: DiscoveryConfig,
    pub liveness_interval_ms: u64,
    pub helpers: Vec<HelperSpec>,
    pub helper_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            sample_interval_ms: 10,
            metrics: MetricKind::ALL.to_vec(),
            network: None,
            discovery: DiscoveryConfig::default(),
            liveness_interval_ms: 500,
            helpers: Vec::new(),
            helper_grace_ms: 5_000,
        }
    }
}

/// Where the packet program is hooked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Ingress and egress classifiers on a clsact qdisc.
    #[default]
    Tc,
    /// One socket filter on a promiscuous `AF_PACKET` socket bound to the
    /// interface. Needs no qdisc.
    Socket,
}

impl AttachMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AttachMode::Tc => "tc",
            AttachMode::Socket => "socket",
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachMode {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tc" => Ok(AttachMode::Tc),
            "socket" => Ok(AttachMode::Socket),
            other => Err(TracerError::ConfigError(format!(
                "unknown attach mode: {} (expected tc or socket)",
                other
            ))),
        }
    }
}

/// Packet probe settings. Present only when network tracing is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
    pub attach: AttachMode,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub drain_interval_ms: u64,
    pub batch_size: usize,
    pub probe_object: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "lo".to_string(),
            attach: AttachMode::Tc,
            src_port: None,
            dst_port: None,
            drain_interval_ms: 10,
            batch_size: crate::ebpf::drain::DEFAULT_BATCH_SIZE,
            probe_object: PathBuf::from(DEFAULT_PROBE_OBJECT),
        }
    }
}

impl NetworkConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            TracerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
            .map_err(|e| TracerError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| TracerError::ConfigError(e.to_string()))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn helper_grace(&self) -> Duration {
        Duration::from_millis(self.helper_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(invalid("sample_interval_ms must be at least 1"));
        }
        if self.liveness_interval_ms == 0 {
            return Err(invalid("liveness_interval_ms must be at least 1"));
        }
        if self.discovery.attempts == 0 {
            return Err(invalid("discovery.attempts must be at least 1"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("output_dir must not be empty"));
        }

        if let Some(network) = &self.network {
            if network.interface.trim().is_empty() {
                return Err(invalid("network.interface must not be empty"));
            }
            if network.drain_interval_ms == 0 {
                return Err(invalid("network.drain_interval_ms must be at least 1"));
            }
            if network.batch_size == 0 {
                return Err(invalid("network.batch_size must be at least 1"));
            }
        }

        let mut names = HashSet::new();
        for helper in &self.helpers {
            if helper.name.is_empty() || helper.name.contains('/') {
                return Err(invalid(format!("invalid helper name '{}'", helper.name)));
            }
            if !names.insert(helper.name.as_str()) {
                return Err(invalid(format!("duplicate helper name '{}'", helper.name)));
            }
            let collides = self.metrics.iter().any(|m| m.sink_name() == helper.name)
                || (self.network.is_some() && helper.name == crate::ebpf::drain::PACKET_SINK);
            if collides {
                return Err(invalid(format!(
                    "helper name '{}' collides with a metric sink",
                    helper.name
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> TracerError {
    TracerError::ConfigError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.output_dir, PathBuf::from("records"));
        assert_eq!(config.sample_interval(), Duration::from_millis(10));
        assert_eq!(config.metrics.len(), MetricKind::ALL.len());
        assert_eq!(config.discovery.attempts, 3);
        assert_eq!(config.discovery.backoff(), Duration::from_secs(1));
        assert_eq!(config.liveness_interval(), Duration::from_millis(500));
        assert_eq!(config.helper_grace(), Duration::from_secs(5));
        assert!(config.network.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(
            r#"
target:
  name: redis-server
output_dir: /var/tmp/run1
sample_interval_ms: 50
metrics: [disk_read, rss_memory, TXQ]
network:
  interface: eth0
  dst_port: 6379
helpers:
  - name: perf_stat
    program: /usr/local/bin/perf-helper
"#,
        )
        .unwrap();

        assert_eq!(config.target, Some(TargetSelector::Name("redis-server".into())));
        assert_eq!(config.metrics.len(), 3);
        let network = config.network.as_ref().unwrap();
        assert_eq!(network.interface, "eth0");
        assert_eq!(network.src_port, None);
        assert_eq!(network.dst_port, Some(6379));
        assert_eq!(network.batch_size, 4096);
        assert_eq!(network.attach, AttachMode::Tc);
        assert_eq!(config.helpers[0].args, HelperSpec::default_args());
        assert_eq!(config.discovery, DiscoveryConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_target_by_pid_and_round_trip() {
        let config = Config::from_yaml("target:\n  pid: 4242\n").unwrap();
        assert_eq!(config.target, Some(TargetSelector::Pid(4242)));

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("target:\n  pid: 4242"));
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);

        let err = Config::from_yaml("target:\n  pid: 1\n  name: init\n").unwrap_err();
        assert!(err.to_string().contains("either pid or name"));
    }

    #[test]
    fn test_socket_attach_mode() {
        let config =
            Config::from_yaml("network:\n  interface: eth1\n  attach: socket\n").unwrap();
        assert_eq!(config.network.unwrap().attach, AttachMode::Socket);

        assert!(Config::from_yaml("network:\n  attach: xdp\n").is_err());
        assert_eq!("socket".parse::<AttachMode>().unwrap(), AttachMode::Socket);
        assert!(matches!(
            "xdp".parse::<AttachMode>(),
            Err(TracerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        assert!(Config::from_yaml("metrics: [disk_reads]").is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config {
            sample_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.sample_interval_ms = 10;
        config.discovery.attempts = 0;
        assert!(config.validate().is_err());

        config.discovery.attempts = 3;
        config.network = Some(NetworkConfig {
            interface: String::new(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.network = Some(NetworkConfig {
            batch_size: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.network = None;
        let helper = HelperSpec::new("stats", "/bin/true");
        config.helpers = vec![helper.clone(), helper];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate helper name"));

        config.helpers = vec![HelperSpec::new("memory", "/bin/true")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/proctrace.yaml")).unwrap_err();
        assert!(matches!(err, TracerError::ConfigError(_)));
    }
}
