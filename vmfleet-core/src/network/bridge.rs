//! Bridge and tap plumbing
//!
//! [`BridgeManager`] is the seam to whatever actually switches packets.
//! `vmfleet-vm` provides an Open vSwitch implementation; [`InMemoryBridges`]
//! keeps the same bookkeeping in process for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument};

use crate::error::{FleetError, FleetResult};

/// Operations on virtual switches and their taps.
///
/// Every method may block on an external process, so callers must not hold
/// a VM lock across these calls.
#[async_trait]
pub trait BridgeManager: Send + Sync {
    /// Fails with [`FleetError::BridgeNotFound`] unless the bridge exists
    async fn get_bridge(&self, bridge: &str) -> FleetResult<()>;

    /// Attaches an existing tap to a bridge on a VLAN
    async fn tap_add(&self, bridge: &str, tap: &str, vlan: i32) -> FleetResult<()>;

    /// Detaches a tap from a bridge
    async fn tap_remove(&self, bridge: &str, tap: &str) -> FleetResult<()>;

    /// Creates a new tap attached to a bridge and returns its name
    async fn tap_create(&self, bridge: &str, vlan: i32) -> FleetResult<String>;

    /// Detaches and deletes a tap. Missing taps are not an error.
    async fn tap_destroy(&self, bridge: &str, tap: &str) -> FleetResult<()>;
}

/// Hands out unique tap device names (`mega_tap0`, `mega_tap1`, ...)
#[derive(Debug)]
pub struct TapNames {
    allocated: Mutex<HashSet<String>>,
    prefix: String,
}

impl TapNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            allocated: Mutex::new(HashSet::new()),
            prefix: prefix.into(),
        }
    }

    /// Reserves the lowest free name
    pub fn allocate(&self) -> String {
        let mut allocated = self.allocated.lock();
        let name = (0u64..)
            .map(|i| format!("{}{}", self.prefix, i))
            .find(|name| !allocated.contains(name))
            .unwrap_or_else(|| format!("{}x", self.prefix));
        allocated.insert(name.clone());
        name
    }

    pub fn release(&self, name: &str) -> bool {
        self.allocated.lock().remove(name)
    }
}

impl Default for TapNames {
    fn default() -> Self {
        Self::new("mega_tap")
    }
}

/// In-process bridge table
#[derive(Debug, Default)]
pub struct InMemoryBridges {
    /// bridge -> (tap -> vlan)
    bridges: Mutex<HashMap<String, BTreeMap<String, i32>>>,
    names: TapNames,
    fail_tap_add: AtomicBool,
}

impl InMemoryBridges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bridges<I, S>(bridges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let this = Self::new();
        for bridge in bridges {
            this.add_bridge(bridge);
        }
        this
    }

    pub fn add_bridge(&self, bridge: impl Into<String>) {
        self.bridges.lock().entry(bridge.into()).or_default();
    }

    /// Taps on a bridge with their VLANs
    pub fn taps(&self, bridge: &str) -> BTreeMap<String, i32> {
        self.bridges.lock().get(bridge).cloned().unwrap_or_default()
    }

    /// Bridge a tap is currently attached to
    pub fn bridge_of(&self, tap: &str) -> Option<String> {
        self.bridges
            .lock()
            .iter()
            .find(|(_, taps)| taps.contains_key(tap))
            .map(|(bridge, _)| bridge.clone())
    }

    /// Makes subsequent `tap_add` calls fail, for exercising partial failures
    pub fn fail_tap_add(&self, fail: bool) {
        self.fail_tap_add.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BridgeManager for InMemoryBridges {
    async fn get_bridge(&self, bridge: &str) -> FleetResult<()> {
        if self.bridges.lock().contains_key(bridge) {
            Ok(())
        } else {
            Err(FleetError::BridgeNotFound(bridge.to_string()))
        }
    }

    #[instrument(skip(self))]
    async fn tap_add(&self, bridge: &str, tap: &str, vlan: i32) -> FleetResult<()> {
        if self.fail_tap_add.load(Ordering::SeqCst) {
            return Err(FleetError::bridge("tap_add", format!("injected failure for {}", tap)));
        }

        let mut bridges = self.bridges.lock();
        if let Some((other, _)) = bridges.iter().find(|(_, taps)| taps.contains_key(tap)) {
            return Err(FleetError::bridge(
                "tap_add",
                format!("tap {} already attached to {}", tap, other),
            ));
        }

        let taps = bridges
            .get_mut(bridge)
            .ok_or_else(|| FleetError::BridgeNotFound(bridge.to_string()))?;
        taps.insert(tap.to_string(), vlan);
        debug!("attached {} to {} on VLAN {}", tap, bridge, vlan);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tap_remove(&self, bridge: &str, tap: &str) -> FleetResult<()> {
        let mut bridges = self.bridges.lock();
        let taps = bridges
            .get_mut(bridge)
            .ok_or_else(|| FleetError::BridgeNotFound(bridge.to_string()))?;

        match taps.remove(tap) {
            Some(_) => {
                debug!("detached {} from {}", tap, bridge);
                Ok(())
            }
            None => Err(FleetError::bridge(
                "tap_remove",
                format!("tap {} is not on bridge {}", tap, bridge),
            )),
        }
    }

    async fn tap_create(&self, bridge: &str, vlan: i32) -> FleetResult<String> {
        self.get_bridge(bridge).await?;
        let tap = self.names.allocate();
        if let Err(e) = self.tap_add(bridge, &tap, vlan).await {
            self.names.release(&tap);
            return Err(e);
        }
        info!("created tap {} on {}", tap, bridge);
        Ok(tap)
    }

    async fn tap_destroy(&self, bridge: &str, tap: &str) -> FleetResult<()> {
        if let Some(taps) = self.bridges.lock().get_mut(bridge) {
            taps.remove(tap);
        }
        self.names.release(tap);
        Ok(())
    }
}
