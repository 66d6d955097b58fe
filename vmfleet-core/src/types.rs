use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{FleetError, FleetResult};

/// Numeric VM identifier, unique for the life of the process and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmId(pub u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VmId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(VmId)
    }
}

/// VM lifecycle state.
///
/// Each concrete state is a single bit so that batch operations can filter
/// eligible VMs with a mask (`state.intersects(VmState::KILLABLE)`) instead
/// of matching exact states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmState(u8);

impl VmState {
    pub const BUILDING: VmState = VmState(1 << 0);
    pub const RUNNING: VmState = VmState(1 << 1);
    pub const PAUSED: VmState = VmState(1 << 2);
    pub const QUITTING: VmState = VmState(1 << 3);
    pub const QUIT: VmState = VmState(1 << 4);
    pub const ERROR: VmState = VmState(1 << 5);

    /// States from which a kill request is legal
    pub const KILLABLE: VmState =
        VmState(Self::BUILDING.0 | Self::RUNNING.0 | Self::PAUSED.0 | Self::QUITTING.0);
    /// States a flush removes
    pub const TERMINAL: VmState = VmState(Self::QUIT.0 | Self::ERROR.0);
    pub const ANY: VmState = VmState(0x3f);

    const NAMES: [(VmState, &'static str); 6] = [
        (Self::BUILDING, "building"),
        (Self::RUNNING, "running"),
        (Self::PAUSED, "paused"),
        (Self::QUITTING, "quitting"),
        (Self::QUIT, "quit"),
        (Self::ERROR, "error"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn intersects(self, mask: VmState) -> bool {
        self.0 & mask.0 != 0
    }

    pub const fn is_terminal(self) -> bool {
        self.intersects(Self::TERMINAL)
    }
}

impl BitOr for VmState {
    type Output = VmState;

    fn bitor(self, rhs: VmState) -> VmState {
        VmState(self.0 | rhs.0)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(state, _)| self.intersects(*state))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

impl fmt::Debug for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmState({})", self)
    }
}

impl FromStr for VmState {
    type Err = FleetError;

    fn from_str(s: &str) -> FleetResult<Self> {
        let wanted = s.trim().to_lowercase();
        Self::NAMES
            .iter()
            .find(|(_, name)| *name == wanted)
            .map(|(state, _)| *state)
            .ok_or_else(|| FleetError::invalid_input("state", format!("unknown state: {}", s)))
    }
}

/// Concrete VM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Kvm,
    Container,
}

impl VmKind {
    pub const ALL: [VmKind; 2] = [VmKind::Kvm, VmKind::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmKind::Kvm => "kvm",
            VmKind::Container => "container",
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmKind {
    type Err = FleetError;

    fn from_str(s: &str) -> FleetResult<Self> {
        match s {
            "kvm" => Ok(VmKind::Kvm),
            "container" => Ok(VmKind::Container),
            other => Err(FleetError::UnknownVmKind(other.to_string())),
        }
    }
}

/// VLAN value of a network entry that is not attached to any bridge
pub const DISCONNECTED_VLAN: i32 = -1;

/// Bandwidth of one tap, in megabits per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TapStat {
    pub rx_mbps: f64,
    pub tx_mbps: f64,
}

impl fmt::Display for TapStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}/{:.1} (rx/tx MB/s)", self.rx_mbps, self.tx_mbps)
    }
}

/// One network interface of a VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub vlan: i32,
    pub bridge: String,
    pub tap: String,
    pub mac: String,
    pub driver: String,
    /// Observed addresses, filled in by a snooping collaborator
    pub ip4: String,
    pub ip6: String,
    /// Snapshot copied from the shared bandwidth table on refresh
    pub stats: Option<TapStat>,
}

impl NetConfig {
    pub fn is_connected(&self) -> bool {
        self.vlan != DISCONNECTED_VLAN
    }
}

impl fmt::Display for NetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.bridge.is_empty() {
            parts.push(self.bridge.clone());
        }
        parts.push(self.vlan.to_string());
        if !self.mac.is_empty() {
            parts.push(self.mac.clone());
        }
        write!(f, "{}", parts.join(","))
    }
}

/// Variant-specific part of a [`VmInfo`].
///
/// Must stay externally tagged: bincode cannot decode internally tagged enums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantInfo {
    Kvm {
        disks: Vec<PathBuf>,
        kernel: Option<PathBuf>,
        initrd: Option<PathBuf>,
        append: Option<String>,
        cdrom: Option<PathBuf>,
        migrate: Option<PathBuf>,
    },
    Container {
        filesystem: Option<PathBuf>,
        init: Vec<String>,
        hostname: Option<String>,
    },
}

/// Point-in-time view of a VM, safe to ship across the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: VmId,
    pub name: String,
    pub namespace: String,
    pub kind: VmKind,
    pub state: VmState,
    pub uuid: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub snapshot: bool,
    pub networks: Vec<NetConfig>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub variant: VariantInfo,
}

/// Valid `vm info` columns, in preferred output order
pub const INFO_COLUMNS: &[&str] = &[
    "id", "name", "state", "namespace", "memory", "vcpus", "type", "vlan", "bridge", "tap", "mac",
    "ip", "ip6", "bandwidth", "migrate", "disk", "snapshot", "initrd", "kernel", "cdrom", "append",
    "filesystem", "init", "uuid", "tags",
];

/// Columns shown by `vm summary`
pub const SUMMARY_COLUMNS: &[&str] = &["id", "name", "state", "namespace", "type", "vlan"];

fn bracketed<T: fmt::Display>(values: impl IntoIterator<Item = T>) -> String {
    let parts: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(" "))
}

fn optional_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

impl VmInfo {
    /// Renders one `vm info` column.
    ///
    /// Variant columns that do not apply (e.g. `disk` on a container) render
    /// empty.
    pub fn column(&self, mask: &str) -> FleetResult<String> {
        let value = match mask {
            "id" => self.id.to_string(),
            "name" => self.name.clone(),
            "state" => self.state.to_string(),
            "namespace" => self.namespace.clone(),
            "memory" => self.memory_mb.to_string(),
            "vcpus" => self.vcpus.to_string(),
            "type" => self.kind.to_string(),
            "snapshot" => self.snapshot.to_string(),
            "uuid" => self.uuid.clone(),
            "vlan" => bracketed(self.networks.iter().map(|n| {
                if n.is_connected() {
                    n.vlan.to_string()
                } else {
                    "disconnected".to_string()
                }
            })),
            "bridge" => bracketed(self.networks.iter().map(|n| n.bridge.clone())),
            "tap" => bracketed(self.networks.iter().map(|n| n.tap.clone())),
            "mac" => bracketed(self.networks.iter().map(|n| n.mac.clone())),
            "ip" => bracketed(self.networks.iter().map(|n| n.ip4.clone())),
            "ip6" => bracketed(self.networks.iter().map(|n| n.ip6.clone())),
            "bandwidth" => bracketed(self.networks.iter().map(|n| match &n.stats {
                Some(stats) => stats.to_string(),
                None => "N/A".to_string(),
            })),
            "tags" => {
                let pairs: Vec<String> = self
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v))
                    .collect();
                format!("map[{}]", pairs.join(" "))
            }
            "disk" | "kernel" | "initrd" | "append" | "cdrom" | "migrate" => match &self.variant {
                VariantInfo::Kvm {
                    disks,
                    kernel,
                    initrd,
                    append,
                    cdrom,
                    migrate,
                } => match mask {
                    "disk" => bracketed(disks.iter().map(|d| d.display().to_string())),
                    "kernel" => optional_path(kernel),
                    "initrd" => optional_path(initrd),
                    "append" => append.clone().unwrap_or_default(),
                    "cdrom" => optional_path(cdrom),
                    _ => optional_path(migrate),
                },
                VariantInfo::Container { .. } => String::new(),
            },
            "filesystem" | "init" => match &self.variant {
                VariantInfo::Container {
                    filesystem, init, ..
                } => {
                    if mask == "filesystem" {
                        optional_path(filesystem)
                    } else {
                        bracketed(init.iter())
                    }
                }
                VariantInfo::Kvm { .. } => String::new(),
            },
            other => {
                return Err(FleetError::invalid_input(
                    "column",
                    format!("field not found: {}", other),
                ))
            }
        };

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(VmState::BUILDING, true; "building")]
    #[test_case(VmState::RUNNING, true; "running")]
    #[test_case(VmState::PAUSED, true; "paused")]
    #[test_case(VmState::QUITTING, true; "quitting")]
    #[test_case(VmState::QUIT, false; "quit")]
    #[test_case(VmState::ERROR, false; "error")]
    fn test_killable_mask(state: VmState, killable: bool) {
        assert_eq!(state.intersects(VmState::KILLABLE), killable);
    }

    #[test]
    fn test_state_names_parse_back() {
        for (state, name) in VmState::NAMES {
            assert_eq!(state.to_string(), name);
            assert_eq!(name.parse::<VmState>().unwrap(), state);
        }
        assert!("sleeping".parse::<VmState>().is_err());
    }

    #[test]
    fn test_composite_mask_display() {
        assert_eq!((VmState::QUIT | VmState::ERROR).to_string(), "quit|error");
        assert_eq!(VmState::ANY.bits().count_ones(), 6);
    }

    #[test]
    fn test_vm_kind_parse() {
        assert_eq!("kvm".parse::<VmKind>().unwrap(), VmKind::Kvm);
        assert!(matches!(
            "xen".parse::<VmKind>(),
            Err(FleetError::UnknownVmKind(ref k)) if k == "xen"
        ));
    }

    fn sample_info() -> VmInfo {
        VmInfo {
            id: VmId(3),
            name: "web3".into(),
            namespace: "prod".into(),
            kind: VmKind::Kvm,
            state: VmState::RUNNING,
            uuid: "u".into(),
            vcpus: 2,
            memory_mb: 1024,
            snapshot: true,
            networks: vec![
                NetConfig {
                    vlan: 101,
                    bridge: "mega_bridge".into(),
                    tap: "mega_tap0".into(),
                    ..Default::default()
                },
                NetConfig {
                    vlan: DISCONNECTED_VLAN,
                    ..Default::default()
                },
            ],
            tags: BTreeMap::from([("role".to_string(), "db".to_string())]),
            created_at: Utc::now(),
            variant: VariantInfo::Kvm {
                disks: vec![PathBuf::from("/images/a.qcow2")],
                kernel: None,
                initrd: None,
                append: None,
                cdrom: None,
                migrate: None,
            },
        }
    }

    #[test]
    fn test_info_columns() {
        let info = sample_info();
        assert_eq!(info.column("vlan").unwrap(), "[101 disconnected]");
        assert_eq!(info.column("bandwidth").unwrap(), "[N/A N/A]");
        assert_eq!(info.column("tags").unwrap(), "map[role:db]");
        assert_eq!(info.column("disk").unwrap(), "[/images/a.qcow2]");
        assert_eq!(info.column("filesystem").unwrap(), "");
        assert!(info.column("cc_active").is_err());
        for column in INFO_COLUMNS {
            assert!(info.column(column).is_ok(), "column {}", column);
        }
    }

    #[test]
    fn test_variant_survives_bincode() {
        let info = sample_info();
        let bytes = bincode::serialize(&vec![info.clone()]).unwrap();
        let decoded: Vec<VmInfo> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, vec![info]);
    }
}
