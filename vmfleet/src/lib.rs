pub mod output;
pub mod parser;

use std::sync::Arc;

use vmfleet_core::network::{BridgeManager, InMemoryBridges};
use vmfleet_core::vm::MockVmFactory;
use vmfleet_core::{Config, FleetResult, SharedNodeState, VmFactoryRegistry, VmKind};
use vmfleet_vm::{register_factories, register_handlers, CommandExecutor, OvsBridges, SystemCommandExecutor};

/// Builds the node context.
///
/// A dry run uses mock VMs on an in-memory default bridge and spawns
/// nothing; otherwise VMs are real processes on Open vSwitch.
pub fn build_node(config: Config, dry_run: bool) -> FleetResult<SharedNodeState> {
    let (factories, bridges) = if dry_run {
        let bridges = Arc::new(InMemoryBridges::with_bridges([
            config.network.default_bridge.clone(),
        ]));
        let mut factories = VmFactoryRegistry::new();
        for kind in VmKind::ALL {
            factories.register(Arc::new(
                MockVmFactory::new(kind).with_bridges(bridges.clone()),
            ));
        }
        (factories, bridges as Arc<dyn BridgeManager>)
    } else {
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(SystemCommandExecutor::new(config.external.clone()));
        let bridges: Arc<dyn BridgeManager> = Arc::new(OvsBridges::new(executor.clone()));
        let mut factories = VmFactoryRegistry::new();
        register_factories(&mut factories, &config, executor, bridges.clone());
        (factories, bridges)
    };

    let node = SharedNodeState::new(config, factories, bridges)?;
    register_handlers(&node);
    Ok(node)
}
