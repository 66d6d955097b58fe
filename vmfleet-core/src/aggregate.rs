//! Fleet-wide VM aggregation
//!
//! A node asks itself and every mesh peer for `vm info` concurrently and
//! merges the answers into one host to VMs map. A peer that errors is
//! logged and left out; the aggregate call itself never fails.

use async_trait::async_trait;
use futures::stream::{self, FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, instrument};

use crate::command::{Command, Response};
use crate::error::FleetResult;
use crate::metrics::names;
use crate::node_shared::SharedNodeState;
use crate::types::{VmInfo, VmState};

/// Delivery of commands to other nodes
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Name of this node on the mesh
    fn hostname(&self) -> &str;

    /// Peers that should receive broadcast commands
    fn broadcast_recipients(&self) -> Vec<String>;

    /// Runs a command on `host` and returns its responses
    async fn send(&self, host: &str, cmd: &Command) -> FleetResult<Vec<Response>>;
}

/// Map of host to the VMs it reported
pub type FleetVms = HashMap<String, Vec<VmInfo>>;

impl SharedNodeState {
    /// Collects `vm info` from this node and every peer.
    ///
    /// Takes the command lock unless `has_lock` says the caller already
    /// holds it, so handlers can aggregate without deadlocking.
    #[instrument(skip(self))]
    pub async fn global_vms(&self, has_lock: bool) -> FleetVms {
        let _guard = if has_lock {
            None
        } else {
            Some(self.lock_commands().await)
        };

        let cmd = Command::new("vm info").unrecorded();

        let local = async {
            let response = self.dispatch(&cmd).await;
            (self.hostname().to_string(), Ok(vec![response]))
        };

        let peers: FuturesUnordered<_> = match self.mesh() {
            Some(mesh) => mesh
                .broadcast_recipients()
                .into_iter()
                .map(|host| {
                    let cmd = &cmd;
                    async move {
                        let result = mesh.send(&host, cmd).await;
                        (host, result)
                    }
                })
                .collect(),
            None => FuturesUnordered::new(),
        };
        debug!("aggregating vm info from {} peers", peers.len());

        let responses = stream::select(stream::once(local), peers);
        futures::pin_mut!(responses);

        let mut fleet = FleetVms::new();
        while let Some((host, result)) = responses.next().await {
            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    error!("vm info from {}: {}", host, e);
                    self.metrics()
                        .increment_counter(names::AGGREGATION_PEER_ERRORS);
                    continue;
                }
            };

            for response in batch {
                if let Some(e) = &response.error {
                    error!("vm info from {}: {}", response.host, e);
                    self.metrics()
                        .increment_counter(names::AGGREGATION_PEER_ERRORS);
                    continue;
                }
                match response.vms() {
                    Some(vms) => {
                        fleet.insert(response.host.clone(), vms.to_vec());
                    }
                    None => error!("unknown data field in vm info from {}", response.host),
                }
            }
        }

        fleet
    }

    /// Names of VMs anywhere in the fleet starting with `prefix` and in `mask`
    pub async fn suggest_vms(&self, prefix: &str, mask: VmState) -> Vec<String> {
        let fleet = self.global_vms(false).await;

        let names: BTreeSet<String> = fleet
            .values()
            .flatten()
            .filter(|vm| vm.state.intersects(mask) && vm.name.starts_with(prefix))
            .map(|vm| vm.name.clone())
            .collect();
        names.into_iter().collect()
    }
}
