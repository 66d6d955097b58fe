//! VM abstraction
//!
//! Every concrete variant embeds a [`BaseVm`] holding the shared identity,
//! state and network fields, and implements [`Vm`] for its own launch and
//! control paths. Variants are created through a [`VmFactory`]; the core
//! only ships the mock factory, the binary registers the real ones.

pub mod base;
pub mod mock;

pub use base::{BaseVm, KillSignal, STATE_FILE};
pub use mock::{MockVm, MockVmFactory};

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{FleetError, FleetResult};
use crate::network::BridgeManager;
use crate::types::{VmId, VmInfo, VmKind, VmState};

/// Identity, lifecycle and networking of one VM
#[async_trait]
pub trait Vm: Send + Sync + 'static {
    fn base(&self) -> &BaseVm;

    fn id(&self) -> VmId {
        self.base().id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn kind(&self) -> VmKind {
        self.base().kind()
    }

    fn state(&self) -> VmState {
        self.base().state()
    }

    /// Brings a BUILDING VM up: RUNNING on success, ERROR on failure
    async fn launch(self: Arc<Self>) -> FleetResult<()>;

    /// PAUSED -> RUNNING
    async fn start(&self) -> FleetResult<()>;

    /// RUNNING -> PAUSED
    async fn stop(&self) -> FleetResult<()>;

    fn kill(&self) -> FleetResult<()> {
        self.base().kill()
    }

    /// Cleans up the instance directory
    async fn flush(&self) -> FleetResult<()> {
        self.base().flush_disk().await
    }

    fn info(&self) -> VmInfo {
        self.base().info()
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A concrete variant that callers can ask for by type
pub trait VmVariant: Vm + Sized {
    const KIND: VmKind;
}

/// Builds VMs of one kind
pub trait VmFactory: Send + Sync {
    fn kind(&self) -> VmKind;

    fn description(&self) -> &'static str;

    fn create(&self, base: BaseVm) -> FleetResult<Arc<dyn Vm>>;
}

/// Registry of VM factories, keyed by kind
#[derive(Clone)]
pub struct VmFactoryRegistry {
    factories: HashMap<VmKind, Arc<dyn VmFactory>>,
}

impl VmFactoryRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory, replacing any previous one for its kind
    pub fn register(&mut self, factory: Arc<dyn VmFactory>) {
        info!(
            "Registering VM factory: {} ({})",
            factory.kind(),
            factory.description()
        );
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: VmKind) -> FleetResult<Arc<dyn VmFactory>> {
        self.factories
            .get(&kind)
            .cloned()
            .ok_or_else(|| FleetError::UnknownVmKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<VmKind> {
        let mut kinds: Vec<VmKind> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for VmFactoryRegistry {
    fn default() -> Self {
        let mut registry = Self::new();

        for kind in VmKind::ALL {
            registry.register(Arc::new(MockVmFactory::new(kind)));
        }

        // NOTE: real factories must be registered by the main binary
        // to avoid circular dependencies

        registry
    }
}

/// Creates a tap for every connected network and records it on the VM
pub async fn attach_networks(base: &BaseVm, bridges: &dyn BridgeManager) -> FleetResult<()> {
    let _ordered = base.order_networks().await;
    for (position, net) in base.networks().into_iter().enumerate() {
        if !net.is_connected() {
            continue;
        }
        let tap = bridges.tap_create(&net.bridge, net.vlan).await?;
        base.set_tap(position, &tap)?;
    }
    Ok(())
}

/// Destroys every tap a VM owns, logging failures
pub async fn release_networks(base: &BaseVm, bridges: &dyn BridgeManager) {
    let _ordered = base.order_networks().await;
    for net in base.networks() {
        if net.tap.is_empty() {
            continue;
        }
        if let Err(e) = bridges.tap_destroy(&net.bridge, &net.tap).await {
            warn!("vm {}: destroy tap {}: {}", base.id(), net.tap, e);
        }
    }
}
