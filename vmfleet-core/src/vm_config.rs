//! Staged VM configuration
//!
//! Operators edit one staged [`VmConfig`] with `vm config <field> <value>`;
//! every VM created afterwards gets a deep copy of it. The combined object
//! carries the fields of every variant, and each variant only reads the
//! subset relevant to it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FleetError, FleetResult};
use crate::types::{NetConfig, VariantInfo, VmKind};

pub const DEFAULT_MEMORY_MB: u64 = 2048;
pub const DEFAULT_VCPUS: u32 = 1;

/// Fields shared by every variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub namespace: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub networks: Vec<NetConfig>,
    pub snapshot: bool,
    /// Preset UUID; generated per VM when unset
    pub uuid: Option<String>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            vcpus: DEFAULT_VCPUS,
            memory_mb: DEFAULT_MEMORY_MB,
            networks: Vec::new(),
            snapshot: true,
            uuid: None,
        }
    }
}

/// Hypervisor-only fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmConfig {
    pub disk_paths: Vec<PathBuf>,
    pub kernel_path: Option<PathBuf>,
    pub initrd_path: Option<PathBuf>,
    pub append: Option<String>,
    pub cdrom_path: Option<PathBuf>,
    pub migrate_path: Option<PathBuf>,
    pub qemu_append: Vec<String>,
}

/// Container-only fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub filesystem_path: Option<PathBuf>,
    pub init: Vec<String>,
    pub preinit: Option<String>,
    pub hostname: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            filesystem_path: None,
            init: vec!["/init".to_string()],
            preinit: None,
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub base: BaseConfig,
    pub kvm: KvmConfig,
    pub container: ContainerConfig,
}

/// Fields accepted by `vm config`. `net` is handled by the caller since it
/// needs the VLAN allocator.
pub const CONFIG_FIELDS: &[&str] = &[
    "vcpus",
    "memory",
    "snapshot",
    "uuid",
    "net",
    "disk",
    "kernel",
    "initrd",
    "append",
    "cdrom",
    "migrate",
    "qemu-append",
    "filesystem",
    "init",
    "preinit",
    "hostname",
];

fn single<'a>(field: &str, values: &'a [String]) -> FleetResult<&'a str> {
    match values {
        [value] => Ok(value.as_str()),
        _ => Err(FleetError::invalid_input(
            field,
            format!("expected exactly one value, got {}", values.len()),
        )),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> FleetResult<T> {
    value
        .parse::<T>()
        .map_err(|_| FleetError::invalid_input(field, format!("not a number: {}", value)))
}

fn show_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

impl VmConfig {
    /// Sets one staged field from operator-supplied values
    pub fn set_field(&mut self, field: &str, values: &[String]) -> FleetResult<()> {
        match field {
            "vcpus" => {
                let vcpus: u32 = parse_number(field, single(field, values)?)?;
                if vcpus == 0 {
                    return Err(FleetError::invalid_input(field, "must be at least 1"));
                }
                self.base.vcpus = vcpus;
            }
            "memory" => {
                let memory: u64 = parse_number(field, single(field, values)?)?;
                if memory == 0 {
                    return Err(FleetError::invalid_input(field, "must be at least 1"));
                }
                self.base.memory_mb = memory;
            }
            "snapshot" => {
                self.base.snapshot = single(field, values)?
                    .parse::<bool>()
                    .map_err(|_| FleetError::invalid_input(field, "expected true or false"))?;
            }
            "uuid" => {
                let value = single(field, values)?;
                uuid::Uuid::parse_str(value)
                    .map_err(|e| FleetError::invalid_input(field, e.to_string()))?;
                self.base.uuid = Some(value.to_lowercase());
            }
            "disk" => self.kvm.disk_paths = values.iter().map(PathBuf::from).collect(),
            "kernel" => self.kvm.kernel_path = Some(PathBuf::from(single(field, values)?)),
            "initrd" => self.kvm.initrd_path = Some(PathBuf::from(single(field, values)?)),
            "append" => self.kvm.append = Some(values.join(" ")),
            "cdrom" => self.kvm.cdrom_path = Some(PathBuf::from(single(field, values)?)),
            "migrate" => self.kvm.migrate_path = Some(PathBuf::from(single(field, values)?)),
            "qemu-append" => self.kvm.qemu_append = values.to_vec(),
            "filesystem" => {
                self.container.filesystem_path = Some(PathBuf::from(single(field, values)?))
            }
            "init" => {
                if values.is_empty() {
                    return Err(FleetError::invalid_input(field, "init needs a command"));
                }
                self.container.init = values.to_vec();
            }
            "preinit" => self.container.preinit = Some(single(field, values)?.to_string()),
            "hostname" => self.container.hostname = Some(single(field, values)?.to_string()),
            other => {
                return Err(FleetError::invalid_input(
                    "config",
                    format!("unknown field: {}", other),
                ))
            }
        }

        Ok(())
    }

    /// Renders one staged field
    pub fn field(&self, field: &str) -> FleetResult<String> {
        let value = match field {
            "vcpus" => self.base.vcpus.to_string(),
            "memory" => self.base.memory_mb.to_string(),
            "snapshot" => self.base.snapshot.to_string(),
            "uuid" => self.base.uuid.clone().unwrap_or_default(),
            "net" => {
                let nets: Vec<String> = self.base.networks.iter().map(|n| n.to_string()).collect();
                format!("[{}]", nets.join(" "))
            }
            "disk" => {
                let disks: Vec<String> = self
                    .kvm
                    .disk_paths
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect();
                disks.join(" ")
            }
            "kernel" => show_path(&self.kvm.kernel_path),
            "initrd" => show_path(&self.kvm.initrd_path),
            "append" => self.kvm.append.clone().unwrap_or_default(),
            "cdrom" => show_path(&self.kvm.cdrom_path),
            "migrate" => show_path(&self.kvm.migrate_path),
            "qemu-append" => self.kvm.qemu_append.join(" "),
            "filesystem" => show_path(&self.container.filesystem_path),
            "init" => self.container.init.join(" "),
            "preinit" => self.container.preinit.clone().unwrap_or_default(),
            "hostname" => self.container.hostname.clone().unwrap_or_default(),
            other => {
                return Err(FleetError::invalid_input(
                    "config",
                    format!("unknown field: {}", other),
                ))
            }
        };

        Ok(value)
    }

    /// Variant-specific subset used in [`crate::types::VmInfo`]
    pub fn variant_info(&self, kind: VmKind) -> VariantInfo {
        match kind {
            VmKind::Kvm => VariantInfo::Kvm {
                disks: self.kvm.disk_paths.clone(),
                kernel: self.kvm.kernel_path.clone(),
                initrd: self.kvm.initrd_path.clone(),
                append: self.kvm.append.clone(),
                cdrom: self.kvm.cdrom_path.clone(),
                migrate: self.kvm.migrate_path.clone(),
            },
            VmKind::Container => VariantInfo::Container {
                filesystem: self.container.filesystem_path.clone(),
                init: self.container.init.clone(),
                hostname: self.container.hostname.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.base.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(config.base.vcpus, DEFAULT_VCPUS);
        assert_eq!(config.container.init, vec!["/init".to_string()]);
    }

    #[test]
    fn test_set_and_show_fields() {
        let mut config = VmConfig::default();
        config.set_field("memory", &values(&["512"])).unwrap();
        config
            .set_field("disk", &values(&["/a.qcow2", "/b.qcow2"]))
            .unwrap();
        config
            .set_field("append", &values(&["console=ttyS0", "quiet"]))
            .unwrap();

        assert_eq!(config.field("memory").unwrap(), "512");
        assert_eq!(config.field("disk").unwrap(), "/a.qcow2 /b.qcow2");
        assert_eq!(config.field("append").unwrap(), "console=ttyS0 quiet");
    }

    #[test]
    fn test_rejects_bad_values_without_mutation() {
        let mut config = VmConfig::default();
        assert!(config.set_field("memory", &values(&["lots"])).is_err());
        assert!(config.set_field("vcpus", &values(&["0"])).is_err());
        assert!(config.set_field("uuid", &values(&["not-a-uuid"])).is_err());
        assert!(config.set_field("colour", &values(&["blue"])).is_err());
        assert_eq!(config, VmConfig::default());
    }

    #[test]
    fn test_variant_info_picks_subset() {
        let mut config = VmConfig::default();
        config.set_field("filesystem", &values(&["/rootfs"])).unwrap();
        match config.variant_info(VmKind::Container) {
            VariantInfo::Container { filesystem, .. } => {
                assert_eq!(filesystem, Some(PathBuf::from("/rootfs")))
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }
}
