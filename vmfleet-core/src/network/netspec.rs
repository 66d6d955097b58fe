//! Compact network specs: `[bridge,]vlan[,mac][,driver]`
//!
//! One to four comma-separated fields. The two and three field forms are
//! ambiguous, so fields are classified by shape:
//!
//! ```text
//! vlan
//! vlan,mac            bridge,vlan          vlan,driver
//! bridge,vlan,mac     vlan,mac,driver      bridge,vlan,driver
//! bridge,vlan,mac,driver
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::vlan::{check_vlan_token, VlanAllocator};
use crate::error::{FleetError, FleetResult};
use crate::types::NetConfig;

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC pattern is a valid regex")
});

/// NIC models the hypervisor accepts
pub const NETWORK_DRIVERS: &[&str] = &[
    "e1000",
    "e1000-82544gc",
    "e1000-82545em",
    "i82550",
    "i82551",
    "i82557a",
    "i82557b",
    "i82557c",
    "i82558a",
    "i82558b",
    "i82559a",
    "i82559b",
    "i82559c",
    "i82559er",
    "i82562",
    "i82801",
    "ne2k_pci",
    "pcnet",
    "rtl8139",
    "virtio-net-pci",
    "vmxnet3",
];

/// OUIs of the common virtualisation vendors
const KNOWN_OUIS: &[&str] = &["52:54:00", "00:16:3e", "00:50:56", "00:0c:29", "08:00:27"];

pub fn is_mac(s: &str) -> bool {
    MAC_RE.is_match(s)
}

pub fn is_network_driver(s: &str) -> bool {
    NETWORK_DRIVERS.contains(&s)
}

/// True when the MAC's OUI belongs to a known virtualisation vendor
pub fn is_registered_mac(mac: &str) -> bool {
    let mac = mac.to_lowercase();
    KNOWN_OUIS.iter().any(|oui| mac.starts_with(oui))
}

/// Defaults applied to fields a netspec omits
#[derive(Debug, Clone)]
pub struct NetDefaults {
    pub bridge: String,
    pub driver: String,
}

impl Default for NetDefaults {
    fn default() -> Self {
        Self {
            bridge: "mega_bridge".to_string(),
            driver: "e1000".to_string(),
        }
    }
}

/// A netspec whose fields are validated but whose VLAN is not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSpec {
    bridge: String,
    vlan: String,
    mac: String,
    driver: String,
}

impl NetSpec {
    /// Checks shape, driver, MAC and VLAN token. Touches no allocator.
    pub fn parse(spec: &str) -> FleetResult<Self> {
        let fields: Vec<&str> = spec.split(',').map(str::trim).collect();

        let (bridge, vlan, mac, driver) = match fields.as_slice() {
            [v] => ("", *v, "", ""),
            [a, b] => {
                if is_mac(b) {
                    ("", *a, *b, "")
                } else if is_network_driver(b) {
                    ("", *a, "", *b)
                } else {
                    (*a, *b, "", "")
                }
            }
            [a, b, c] => {
                if is_mac(c) {
                    (*a, *b, *c, "")
                } else if is_mac(b) {
                    ("", *a, *b, *c)
                } else {
                    (*a, *b, "", *c)
                }
            }
            [b, v, m, d] => (*b, *v, *m, *d),
            _ => {
                return Err(FleetError::malformed_netspec(
                    spec,
                    format!("expected 1 to 4 fields, got {}", fields.len()),
                ))
            }
        };

        if !driver.is_empty() && !is_network_driver(driver) {
            return Err(FleetError::malformed_netspec(
                spec,
                format!("invalid driver: {}", driver),
            ));
        }

        if !mac.is_empty() && !is_mac(mac) {
            return Err(FleetError::malformed_netspec(
                spec,
                format!("invalid mac address: {}", mac),
            ));
        }

        if vlan.is_empty() {
            return Err(FleetError::malformed_netspec(spec, "missing VLAN"));
        }
        check_vlan_token(vlan)?;

        Ok(Self {
            bridge: bridge.to_string(),
            vlan: vlan.to_string(),
            mac: mac.to_string(),
            driver: driver.to_string(),
        })
    }

    /// Resolves the VLAN through the allocator and fills in defaults
    pub fn resolve(
        &self,
        namespace: &str,
        vlans: &VlanAllocator,
        defaults: &NetDefaults,
    ) -> FleetResult<NetConfig> {
        let vlan = vlans.parse_vlan(namespace, &self.vlan)?;

        if !self.mac.is_empty() && !is_registered_mac(&self.mac) {
            warn!("unallocated mac address: {}", self.mac);
        }

        Ok(NetConfig {
            vlan,
            bridge: if self.bridge.is_empty() {
                defaults.bridge.clone()
            } else {
                self.bridge.clone()
            },
            mac: self.mac.to_lowercase(),
            driver: if self.driver.is_empty() {
                defaults.driver.clone()
            } else {
                self.driver.clone()
            },
            ..Default::default()
        })
    }
}

/// Parses one netspec into a [`NetConfig`].
///
/// Every field is validated before the VLAN token is resolved, so a
/// malformed spec never allocates an alias.
pub fn parse_netspec(
    spec: &str,
    namespace: &str,
    vlans: &VlanAllocator,
    defaults: &NetDefaults,
) -> FleetResult<NetConfig> {
    NetSpec::parse(spec)?.resolve(namespace, vlans, defaults)
}

/// Parses several netspecs. All of them are validated before any VLAN is
/// resolved, so one malformed spec leaves the allocator untouched.
pub fn parse_netspecs(
    specs: &[String],
    namespace: &str,
    vlans: &VlanAllocator,
    defaults: &NetDefaults,
) -> FleetResult<Vec<NetConfig>> {
    let parsed = specs
        .iter()
        .map(|spec| NetSpec::parse(spec))
        .collect::<FleetResult<Vec<_>>>()?;
    parsed
        .iter()
        .map(|spec| spec.resolve(namespace, vlans, defaults))
        .collect()
}
