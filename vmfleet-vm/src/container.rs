//! Container-backed VMs
//!
//! The init process runs under `unshare` in fresh PID, mount, UTS and IPC
//! namespaces, rooted at the configured filesystem, and dies with `unshare`.
//! Pause and resume go through a freezer cgroup named after the VM id.

use async_trait::async_trait;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tracing::{debug, info, instrument, warn};

use vmfleet_core::network::BridgeManager;
use vmfleet_core::vm::{attach_networks, release_networks};
use vmfleet_core::vm_config::ContainerConfig;
use vmfleet_core::{
    BaseVm, FleetError, FleetResult, Vm, VmFactory, VmKind, VmState, VmVariant,
};

use crate::process_manager::{exec_error, monitor_process, CommandExecutor};

pub const FREEZER_STATE: &str = "freezer.state";
pub const CGROUP_PROCS: &str = "cgroup.procs";

pub const FROZEN: &str = "FROZEN";
pub const THAWED: &str = "THAWED";

/// `unshare` arguments for a container rooted at `filesystem`.
///
/// A hostname or preinit script runs through `/bin/sh` inside the new
/// namespaces before the shell execs into init.
pub fn build_args(filesystem: &Path, config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "--fork",
        "--kill-child",
        "--pid",
        "--mount-proc",
        "--uts",
        "--ipc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--root={}", filesystem.display()));
    args.push("--wd=/".to_string());

    let mut setup = Vec::new();
    if let Some(hostname) = &config.hostname {
        setup.push(format!("hostname {}", hostname));
    }
    if let Some(preinit) = &config.preinit {
        setup.push(preinit.clone());
    }

    if !setup.is_empty() {
        setup.push("exec \"$@\"".to_string());
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(setup.join(" && "));
        args.push("sh".to_string());
    }
    args.extend(config.init.iter().cloned());
    args
}

pub struct ContainerVm {
    base: BaseVm,
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
    cgroup: PathBuf,
}

impl ContainerVm {
    pub fn new(
        base: BaseVm,
        executor: Arc<dyn CommandExecutor>,
        bridges: Arc<dyn BridgeManager>,
        cgroup_root: &Path,
    ) -> Self {
        let cgroup = cgroup_root.join(base.id().to_string());
        Self {
            base,
            executor,
            bridges,
            cgroup,
        }
    }

    pub fn cgroup(&self) -> &Path {
        &self.cgroup
    }

    async fn freeze(&self, state: &str) -> FleetResult<()> {
        let path = self.cgroup.join(FREEZER_STATE);
        tokio::fs::write(&path, state).await.map_err(|e| {
            FleetError::operation_failed("freezer", format!("{}: {}", path.display(), e))
        })
    }

    async fn bring_up(&self) -> FleetResult<Child> {
        let config = &self.base.config().container;
        let filesystem = config.filesystem_path.as_ref().ok_or_else(|| {
            FleetError::invalid_input("filesystem", "container requires a root filesystem")
        })?;
        if config.init.is_empty() {
            return Err(FleetError::invalid_input("init", "container requires an init"));
        }

        tokio::fs::create_dir_all(&self.cgroup).await.map_err(|e| {
            FleetError::Environment {
                details: format!("create cgroup {}: {}", self.cgroup.display(), e),
            }
        })?;

        attach_networks(&self.base, self.bridges.as_ref()).await?;

        let args = build_args(filesystem, config);
        debug!("vm {} unshare args: {:?}", self.base.id(), args);

        let (child, pid) = self
            .executor
            .spawn("unshare", &args, None)
            .await
            .map_err(|e| exec_error("launch", "unshare", e))?;

        // dropping the child on error kills it
        let procs = self.cgroup.join(CGROUP_PROCS);
        tokio::fs::write(&procs, pid.to_string()).await.map_err(|e| {
            FleetError::operation_failed("launch", format!("{}: {}", procs.display(), e))
        })?;

        info!("vm {} container init running as pid {}", self.base.id(), pid);
        Ok(child)
    }

    async fn remove_cgroup(&self) {
        match tokio::fs::remove_dir(&self.cgroup).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("remove cgroup {}: {}", self.cgroup.display(), e),
        }
    }
}

#[async_trait]
impl Vm for ContainerVm {
    fn base(&self) -> &BaseVm {
        &self.base
    }

    #[instrument(skip(self), fields(vm_id = %self.base.id()))]
    async fn launch(self: Arc<Self>) -> FleetResult<()> {
        let child = match self.bring_up().await {
            Ok(child) => child,
            Err(e) => {
                release_networks(&self.base, self.bridges.as_ref()).await;
                self.base.launch_failed();
                return Err(e);
            }
        };

        self.base.set_state_if(VmState::BUILDING, VmState::RUNNING);
        let executor = self.executor.clone();
        let bridges = self.bridges.clone();
        monitor_process(self, child, executor, bridges);
        Ok(())
    }

    async fn start(&self) -> FleetResult<()> {
        self.base.check_state("start", VmState::PAUSED)?;
        self.freeze(THAWED).await?;
        self.base.set_state_if(VmState::PAUSED, VmState::RUNNING);
        Ok(())
    }

    async fn stop(&self) -> FleetResult<()> {
        self.base.check_state("stop", VmState::RUNNING)?;
        self.freeze(FROZEN).await?;
        self.base.set_state_if(VmState::RUNNING, VmState::PAUSED);
        Ok(())
    }

    async fn flush(&self) -> FleetResult<()> {
        self.remove_cgroup().await;
        self.base.flush_disk().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl VmVariant for ContainerVm {
    const KIND: VmKind = VmKind::Container;
}

/// Creates container-backed VMs
pub struct ContainerFactory {
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
    cgroup_root: PathBuf,
}

impl ContainerFactory {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        bridges: Arc<dyn BridgeManager>,
        cgroup_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            bridges,
            cgroup_root: cgroup_root.into(),
        }
    }
}

impl VmFactory for ContainerFactory {
    fn kind(&self) -> VmKind {
        VmKind::Container
    }

    fn description(&self) -> &'static str {
        "Namespaced init process paused through a freezer cgroup"
    }

    fn create(&self, base: BaseVm) -> FleetResult<Arc<dyn Vm>> {
        Ok(Arc::new(ContainerVm::new(
            base,
            self.executor.clone(),
            self.bridges.clone(),
            &self.cgroup_root,
        )))
    }
}
