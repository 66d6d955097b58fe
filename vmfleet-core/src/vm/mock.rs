//! Mock VM for tests and dry runs
//!
//! Behaves like a real variant (state transitions, taps, kill monitor)
//! without spawning anything.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{attach_networks, release_networks, BaseVm, Vm, VmFactory};
use crate::error::{FleetError, FleetResult};
use crate::network::BridgeManager;
use crate::types::{VmKind, VmState};

pub struct MockVm {
    base: BaseVm,
    fail_launch: bool,
    bridges: Option<Arc<dyn BridgeManager>>,
}

impl std::fmt::Debug for MockVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVm")
            .field("base", &self.base)
            .field("fail_launch", &self.fail_launch)
            .field("bridges", &self.bridges.is_some())
            .finish()
    }
}

impl MockVm {
    pub fn new(base: BaseVm) -> Self {
        Self {
            base,
            fail_launch: false,
            bridges: None,
        }
    }

    async fn bring_up(&self) -> FleetResult<()> {
        if self.fail_launch {
            return Err(FleetError::operation_failed(
                "launch",
                format!("mock launch failure for {}", self.base.name()),
            ));
        }
        if let Some(bridges) = &self.bridges {
            attach_networks(&self.base, bridges.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Vm for MockVm {
    fn base(&self) -> &BaseVm {
        &self.base
    }

    async fn launch(self: Arc<Self>) -> FleetResult<()> {
        if let Err(e) = self.bring_up().await {
            self.base.launch_failed();
            return Err(e);
        }

        self.base.set_state_if(VmState::BUILDING, VmState::RUNNING);

        let this = self.clone();
        tokio::spawn(async move {
            this.base.kill_signal().fired().await;
            if let Some(bridges) = &this.bridges {
                release_networks(&this.base, bridges.as_ref()).await;
            }
            this.base.set_state_if(VmState::KILLABLE, VmState::QUIT);
            this.base.ack_kill();
            debug!("mock vm {} exited", this.base.id());
        });

        info!("launched mock vm {} ({})", self.base.id(), self.base.name());
        Ok(())
    }

    async fn start(&self) -> FleetResult<()> {
        self.base.check_state("start", VmState::PAUSED)?;
        self.base.set_state_if(VmState::PAUSED, VmState::RUNNING);
        Ok(())
    }

    async fn stop(&self) -> FleetResult<()> {
        self.base.check_state("stop", VmState::RUNNING)?;
        self.base.set_state_if(VmState::RUNNING, VmState::PAUSED);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Factory for mock VMs of either kind
pub struct MockVmFactory {
    kind: VmKind,
    fail_names: HashSet<String>,
    bridges: Option<Arc<dyn BridgeManager>>,
}

impl MockVmFactory {
    pub fn new(kind: VmKind) -> Self {
        Self {
            kind,
            fail_names: HashSet::new(),
            bridges: None,
        }
    }

    /// VMs with these names fail to launch
    pub fn failing_for<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Create real taps on these bridges at launch
    pub fn with_bridges(mut self, bridges: Arc<dyn BridgeManager>) -> Self {
        self.bridges = Some(bridges);
        self
    }
}

impl VmFactory for MockVmFactory {
    fn kind(&self) -> VmKind {
        self.kind
    }

    fn description(&self) -> &'static str {
        "Mock VM for testing (no processes are spawned)"
    }

    fn create(&self, base: BaseVm) -> FleetResult<Arc<dyn Vm>> {
        let fail_launch = self.fail_names.contains(base.name());
        Ok(Arc::new(MockVm {
            base,
            fail_launch,
            bridges: self.bridges.clone(),
        }))
    }
}
