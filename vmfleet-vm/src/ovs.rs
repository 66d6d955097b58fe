//! Open vSwitch bridge manager
//!
//! Ports are managed with `ovs-vsctl`, tap devices with `ip tuntap`. Every
//! call shells out, so callers hold no VM lock across them.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use vmfleet_core::network::{BridgeManager, TapNames};
use vmfleet_core::{FleetError, FleetResult};

use crate::process_manager::{exec_error, run_checked, CommandExecutor};

/// `ovs-vsctl br-exists` exit code for a missing bridge
const BRIDGE_MISSING: i32 = 2;

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub struct OvsBridges {
    executor: Arc<dyn CommandExecutor>,
    names: TapNames,
}

impl OvsBridges {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            names: TapNames::default(),
        }
    }

    async fn ovs(&self, operation: &str, items: &[&str]) -> FleetResult<()> {
        run_checked(self.executor.as_ref(), operation, "ovs", &args(items))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                FleetError::VmOperationFailed { operation, details } => {
                    FleetError::bridge(operation, details)
                }
                other => other,
            })
    }

    async fn ip(&self, operation: &str, items: &[&str]) -> FleetResult<()> {
        run_checked(self.executor.as_ref(), operation, "ip", &args(items))
            .await
            .map(|_| ())
    }

    async fn delete_device(&self, tap: &str) {
        if let Err(e) = self.ip("tap_destroy", &["tuntap", "del", "dev", tap, "mode", "tap"]).await {
            warn!("delete tap device {}: {}", tap, e);
        }
    }
}

#[async_trait]
impl BridgeManager for OvsBridges {
    async fn get_bridge(&self, bridge: &str) -> FleetResult<()> {
        let output = self
            .executor
            .execute("ovs", &args(&["br-exists", bridge]))
            .await
            .map_err(|e| exec_error("get_bridge", "ovs", e))?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(BRIDGE_MISSING) => Err(FleetError::BridgeNotFound(bridge.to_string())),
            _ => Err(FleetError::bridge("get_bridge", output.stderr_lossy())),
        }
    }

    #[instrument(skip(self))]
    async fn tap_add(&self, bridge: &str, tap: &str, vlan: i32) -> FleetResult<()> {
        let tag = format!("tag={}", vlan);
        self.ovs("tap_add", &["add-port", bridge, tap, &tag]).await
    }

    #[instrument(skip(self))]
    async fn tap_remove(&self, bridge: &str, tap: &str) -> FleetResult<()> {
        self.ovs("tap_remove", &["del-port", bridge, tap]).await
    }

    #[instrument(skip(self))]
    async fn tap_create(&self, bridge: &str, vlan: i32) -> FleetResult<String> {
        self.get_bridge(bridge).await?;
        let tap = self.names.allocate();

        if let Err(e) = self
            .ip("tap_create", &["tuntap", "add", "dev", &tap, "mode", "tap"])
            .await
        {
            self.names.release(&tap);
            return Err(e);
        }

        let attached = match self.ip("tap_create", &["link", "set", "dev", &tap, "up"]).await {
            Ok(()) => self.tap_add(bridge, &tap, vlan).await,
            Err(e) => Err(e),
        };
        if let Err(e) = attached {
            self.delete_device(&tap).await;
            self.names.release(&tap);
            return Err(e);
        }

        info!("created tap {} on {} VLAN {}", tap, bridge, vlan);
        Ok(tap)
    }

    #[instrument(skip(self))]
    async fn tap_destroy(&self, bridge: &str, tap: &str) -> FleetResult<()> {
        // the port may already be gone after a disconnect
        let result = self
            .ovs("tap_destroy", &["--if-exists", "del-port", bridge, tap])
            .await;
        self.delete_device(tap).await;
        self.names.release(tap);
        result
    }
}
