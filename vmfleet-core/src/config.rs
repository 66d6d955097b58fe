//! Configuration management with TOML support
//!
//! This module provides the node configuration:
//! - Loads from TOML files
//! - Supports environment variable overrides
//! - Validates configuration values
//!
//! There is no global instance; the loaded [`Config`] is handed to
//! [`crate::node_shared::SharedNodeState`] at startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FleetError, FleetResult};
use crate::network::netspec::is_network_driver;

/// Complete configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and on-disk layout
    pub node: NodeConfig,

    /// Bridge and VLAN allocation
    pub network: NetworkConfig,

    /// Defaults for newly staged VMs
    pub vm: VmDefaults,

    /// Hypervisor control
    pub kvm: KvmSettings,

    /// Container runtime
    pub container: ContainerSettings,

    /// Names of external executables
    pub external: ExternalProcesses,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name this node reports in aggregated responses; detected when unset
    pub hostname: Option<String>,

    /// Parent of every VM instance directory
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_bridge: String,
    pub default_driver: String,

    /// Inclusive range handed out for VLAN aliases
    pub vlan_min: i32,
    pub vlan_max: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub memory_mb: u64,
    pub vcpus: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmSettings {
    /// Attempts to reach a freshly spawned VM's QMP socket
    pub qmp_connect_retries: u32,

    #[serde(with = "humantime_serde")]
    pub qmp_connect_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Freezer cgroup hierarchy containers are placed under
    pub cgroup_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalProcesses {
    pub qemu: String,
    pub ovs: String,
    pub ip: String,
    pub unshare: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            base_dir: PathBuf::from("/tmp/vmfleet"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_bridge: "mega_bridge".to_string(),
            default_driver: "e1000".to_string(),
            vlan_min: 101,
            vlan_max: 4095,
        }
    }
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            memory_mb: crate::vm_config::DEFAULT_MEMORY_MB,
            vcpus: crate::vm_config::DEFAULT_VCPUS,
        }
    }
}

impl Default for KvmSettings {
    fn default() -> Self {
        Self {
            qmp_connect_retries: 50,
            qmp_connect_delay: Duration::from_millis(100),
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup/freezer/vmfleet"),
        }
    }
}

impl Default for ExternalProcesses {
    fn default() -> Self {
        Self {
            qemu: "kvm".to_string(),
            ovs: "ovs-vsctl".to_string(),
            ip: "ip".to_string(),
            unshare: "unshare".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ExternalProcesses {
    /// Maps a logical process name to the configured executable
    pub fn binary(&self, process: &str) -> FleetResult<&str> {
        match process {
            "qemu" => Ok(&self.qemu),
            "ovs" => Ok(&self.ovs),
            "ip" => Ok(&self.ip),
            "unshare" => Ok(&self.unshare),
            other => Err(FleetError::Environment {
                details: format!("unknown external process: {}", other),
            }),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> FleetResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            FleetError::configuration("file", format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(hostname) = std::env::var("VMFLEET_HOSTNAME") {
            self.node.hostname = Some(hostname);
        }
        if let Ok(dir) = std::env::var("VMFLEET_BASE_DIR") {
            self.node.base_dir = PathBuf::from(dir);
        }
        if let Ok(bridge) = std::env::var("VMFLEET_DEFAULT_BRIDGE") {
            self.network.default_bridge = bridge;
        }
        if let Ok(qemu) = std::env::var("VMFLEET_QEMU") {
            self.external.qemu = qemu;
        }
        if let Ok(level) = std::env::var("VMFLEET_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> FleetResult<()> {
        if self.node.base_dir.as_os_str().is_empty() {
            return Err(FleetError::configuration(
                "node.base_dir",
                "Base directory cannot be empty",
            ));
        }

        if self.network.default_bridge.is_empty() {
            return Err(FleetError::configuration(
                "network.default_bridge",
                "Default bridge cannot be empty",
            ));
        }

        if !is_network_driver(&self.network.default_driver) {
            return Err(FleetError::configuration(
                "network.default_driver",
                format!("Unknown network driver: {}", self.network.default_driver),
            ));
        }

        let valid = 1..=4095;
        if !valid.contains(&self.network.vlan_min) || !valid.contains(&self.network.vlan_max) {
            return Err(FleetError::configuration(
                "network.vlan_range",
                "VLAN bounds must be within 1..=4095",
            ));
        }
        if self.network.vlan_min > self.network.vlan_max {
            return Err(FleetError::configuration(
                "network.vlan_range",
                "vlan_min must not exceed vlan_max",
            ));
        }

        if self.vm.memory_mb == 0 || self.vm.vcpus == 0 {
            return Err(FleetError::configuration(
                "vm",
                "Memory and vcpus must be at least 1",
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(FleetError::configuration(
                    "logging.level",
                    format!("Invalid log level: {}", self.logging.level),
                ))
            }
        }

        Ok(())
    }

    /// Configured hostname, falling back to the kernel's
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.node.hostname {
            return hostname.clone();
        }

        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                fs::read_to_string("/proc/sys/kernel/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.node.hostname = Some(hostname.into());
        self
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.node.base_dir = dir.into();
        self
    }

    pub fn default_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.config.network.default_bridge = bridge.into();
        self
    }

    pub fn vlan_range(mut self, min: i32, max: i32) -> Self {
        self.config.network.vlan_min = min;
        self.config.network.vlan_max = max;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> FleetResult<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
