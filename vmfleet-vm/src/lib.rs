pub mod container;
pub mod handlers;
pub mod kvm;
pub mod ovs;
pub mod process_manager;
pub mod qmp;

pub use container::{ContainerFactory, ContainerVm};
pub use handlers::KvmHandler;
pub use kvm::{KvmFactory, KvmVm};
pub use ovs::OvsBridges;
pub use process_manager::{CommandExecutor, CommandOutput, SystemCommandExecutor};
pub use qmp::{QmpChannel, QmpConnector, UnixQmp, UnixQmpConnector};

use std::sync::Arc;

use vmfleet_core::network::BridgeManager;
use vmfleet_core::{Config, SharedNodeState, VmFactoryRegistry};

/// Replaces the mock factories with the real KVM and container ones
pub fn register_factories(
    registry: &mut VmFactoryRegistry,
    config: &Config,
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
) {
    let connector = Arc::new(UnixQmpConnector::new(
        config.kvm.qmp_connect_retries,
        config.kvm.qmp_connect_delay,
    ));
    registry.register(Arc::new(KvmFactory::new(
        executor.clone(),
        bridges.clone(),
        connector,
    )));
    registry.register(Arc::new(ContainerFactory::new(
        executor,
        bridges,
        config.container.cgroup_root.clone(),
    )));
}

/// Adds the variant-only commands to a node
pub fn register_handlers(node: &SharedNodeState) {
    node.register_handler(Arc::new(KvmHandler));
}
