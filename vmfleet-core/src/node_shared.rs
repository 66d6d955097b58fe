use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::aggregate::MeshTransport;
use crate::command::{Command, Response};
use crate::config::Config;
use crate::error::FleetResult;
use crate::handlers;
use crate::metrics::{names, MetricsRegistry};
use crate::network::{BandwidthStats, BridgeManager, NetDefaults, VlanAllocator};
use crate::registry::VmRegistry;
use crate::vm::VmFactoryRegistry;

/// A handler for command patterns the core does not know about.
///
/// Variant crates register these for variant-only commands such as
/// `vm qmp` or `vm hotplug`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn patterns(&self) -> Vec<&'static str>;

    async fn handle(&self, node: &SharedNodeState, cmd: &Command) -> FleetResult<Response>;
}

/// Process-wide node context
///
/// Everything a command handler can touch lives here and is passed
/// explicitly; there are no globals.
///
/// ## State Categories
///
/// ### VM state
/// - `registry`: every VM on this node, the staged config and the active namespace
///
/// ### Network state
/// - `vlans`: alias to VLAN tag table, shared by every namespace
/// - `bridges`: the switch implementation taps are attached to
/// - `bandwidth`: per-tap stats written by a monitor, read on `vm info`
///
/// ### Fleet
/// - `mesh`: peers reachable for aggregation, if this node is meshed
///
/// ## Locking
/// `cmd_lock` serializes operator commands. Handlers run with it held;
/// code that calls back into [`SharedNodeState::dispatch`] must say whether
/// it already holds it (see `global_vms`).
pub struct SharedNodeState {
    config: Config,
    hostname: String,

    registry: Arc<VmRegistry>,

    vlans: Arc<VlanAllocator>,
    bridges: Arc<dyn BridgeManager>,
    bandwidth: BandwidthStats,
    net_defaults: NetDefaults,

    mesh: Option<Arc<dyn MeshTransport>>,

    cmd_lock: Mutex<()>,
    metrics: MetricsRegistry,
    extensions: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl SharedNodeState {
    pub fn new(
        config: Config,
        factories: VmFactoryRegistry,
        bridges: Arc<dyn BridgeManager>,
    ) -> FleetResult<Self> {
        config.validate()?;

        let metrics = MetricsRegistry::new();
        let hostname = config.hostname();
        let registry = Arc::new(VmRegistry::from_config(
            &config,
            factories,
            metrics.clone(),
        ));
        let vlans = Arc::new(VlanAllocator::with_metrics(
            config.network.vlan_min,
            config.network.vlan_max,
            metrics.clone(),
        ));
        let net_defaults = NetDefaults {
            bridge: config.network.default_bridge.clone(),
            driver: config.network.default_driver.clone(),
        };

        info!("node {} ready, instance root {}", hostname, config.node.base_dir.display());

        Ok(Self {
            config,
            hostname,
            registry,
            vlans,
            bridges,
            bandwidth: BandwidthStats::new(),
            net_defaults,
            mesh: None,
            cmd_lock: Mutex::new(()),
            metrics,
            extensions: RwLock::new(HashMap::new()),
        })
    }

    /// Joins this node to a mesh for fleet-wide aggregation
    pub fn with_mesh(mut self, mesh: Arc<dyn MeshTransport>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    pub fn vlans(&self) -> &Arc<VlanAllocator> {
        &self.vlans
    }

    pub fn bridges(&self) -> &Arc<dyn BridgeManager> {
        &self.bridges
    }

    pub fn bandwidth(&self) -> &BandwidthStats {
        &self.bandwidth
    }

    pub fn net_defaults(&self) -> &NetDefaults {
        &self.net_defaults
    }

    pub fn mesh(&self) -> Option<&Arc<dyn MeshTransport>> {
        self.mesh.as_ref()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Active namespace, or the empty string
    pub fn namespace(&self) -> String {
        self.registry.namespace().unwrap_or_default()
    }

    /// Takes the command lock. Pass `has_lock = true` to aggregation while
    /// holding the guard.
    pub async fn lock_commands(&self) -> MutexGuard<'_, ()> {
        self.cmd_lock.lock().await
    }

    /// Routes the handler's patterns to it, replacing earlier registrations
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        let mut extensions = self.extensions.write();
        for pattern in handler.patterns() {
            debug!("registering handler for `{}`", pattern);
            extensions.insert(pattern.to_string(), handler.clone());
        }
    }

    /// Runs one operator command under the command lock
    pub async fn process(&self, cmd: &Command) -> Response {
        let _guard = self.lock_commands().await;
        self.dispatch(cmd).await
    }

    /// Runs one command. The caller must already hold the command lock.
    pub async fn dispatch(&self, cmd: &Command) -> Response {
        self.metrics.increment_counter(names::COMMANDS_PROCESSED);
        if cmd.record {
            debug!("command `{}` from {:?}", cmd.pattern, cmd.source);
        }

        let extension = self.extensions.read().get(&cmd.pattern).cloned();
        let result = match extension {
            Some(handler) => handler.handle(self, cmd).await,
            None => handlers::builtin(self, cmd).await,
        };

        match result {
            Ok(mut response) => {
                response.host = self.hostname.clone();
                response
            }
            Err(e) => {
                debug!("command `{}` failed: {}", cmd.pattern, e);
                Response::failed(&self.hostname, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::network::InMemoryBridges;
    use tempfile::TempDir;

    fn node(dir: &TempDir) -> SharedNodeState {
        let config = ConfigBuilder::new()
            .hostname("node1")
            .base_dir(dir.path())
            .build()
            .unwrap();
        SharedNodeState::new(
            config,
            VmFactoryRegistry::default(),
            Arc::new(InMemoryBridges::with_bridges(["mega_bridge"])),
        )
        .unwrap()
    }

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        fn patterns(&self) -> Vec<&'static str> {
            vec!["echo", "vm info"]
        }

        async fn handle(&self, _node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
            Ok(Response::new("").text(cmd.string_arg("text").unwrap_or_default()))
        }
    }

    #[tokio::test]
    async fn test_unknown_command_is_an_error_response() {
        let dir = TempDir::new().unwrap();
        let resp = node(&dir).process(&Command::new("frobnicate")).await;
        assert_eq!(resp.host, "node1");
        assert!(resp.error.unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn test_extension_handler_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        node.register_handler(Arc::new(Echo));

        let resp = node.process(&Command::new("echo").arg("text", "hi")).await;
        assert_eq!(resp.response, "hi");
        assert_eq!(resp.host, "node1");
        assert!(node.process(&Command::new("vm info")).await.vms().is_none());
        assert_eq!(node.metrics().get_counter(names::COMMANDS_PROCESSED), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = ConfigBuilder::new().base_dir(dir.path()).build().unwrap();
        config.network.vlan_min = 10;
        config.network.vlan_max = 5;
        let result = SharedNodeState::new(
            config,
            VmFactoryRegistry::default(),
            Arc::new(InMemoryBridges::new()),
        );
        assert!(result.is_err());
    }
}
