//! Network topology: VLAN allocation, netspec parsing, bridge plumbing
//! and the shared bandwidth table.

pub mod bridge;
pub mod netspec;
pub mod vlan;

pub use bridge::{BridgeManager, InMemoryBridges, TapNames};
pub use netspec::{parse_netspec, parse_netspecs, NetDefaults, NetSpec};
pub use vlan::{check_vlan_token, VlanAllocator, ALIAS_SEP, BLACKLISTED};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::TapStat;

/// Per-tap bandwidth, written by a monitoring collaborator and read by VMs
/// when they refresh their cached snapshot.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    table: Arc<RwLock<HashMap<String, TapStat>>>,
}

impl BandwidthStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tap: impl Into<String>, stat: TapStat) {
        self.table.write().insert(tap.into(), stat);
    }

    pub fn remove(&self, tap: &str) {
        self.table.write().remove(tap);
    }

    pub fn get(&self, tap: &str) -> Option<TapStat> {
        self.table.read().get(tap).copied()
    }
}
