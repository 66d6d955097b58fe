//! Hypervisor-backed VMs
//!
//! A `KvmVm` is one hypervisor process running in the VM's instance
//! directory. Launch creates taps, spawns the process and hands it to
//! [`monitor_process`]; everything afterwards goes over the QMP socket in
//! that directory.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tracing::{debug, info, instrument};

use vmfleet_core::network::BridgeManager;
use vmfleet_core::vm::{attach_networks, release_networks};
use vmfleet_core::{
    BaseVm, FleetError, FleetResult, Vm, VmFactory, VmKind, VmState, VmVariant,
};

use crate::process_manager::{exec_error, monitor_process, CommandExecutor};
use crate::qmp::{LazyQmp, QmpConnector};

/// QMP socket name inside the instance directory
pub const QMP_SOCKET: &str = "qmp";

/// Drive name of the always-present cdrom slot
pub const CDROM_DEVICE: &str = "ide0-cd1";

/// States in which the hypervisor answers on QMP
fn live() -> VmState {
    VmState::RUNNING | VmState::PAUSED
}

/// Random MAC in the QEMU `52:54:00` range
pub fn random_mac() -> String {
    let tail: [u8; 3] = rand::thread_rng().gen();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Builds the hypervisor argument vector for a VM.
///
/// Only networks that have a tap get a netdev; a network staged as
/// disconnected has nothing to plug in.
pub fn build_args(base: &BaseVm) -> Vec<String> {
    let common = &base.config().base;
    let kvm = &base.config().kvm;
    let qmp = base.instance_path().join(QMP_SOCKET);

    let mut args: Vec<String> = vec![
        "-enable-kvm".into(),
        "-name".into(),
        base.id().to_string(),
        "-m".into(),
        common.memory_mb.to_string(),
        "-smp".into(),
        common.vcpus.to_string(),
        "-uuid".into(),
        base.uuid().to_string(),
        "-nographic".into(),
        "-qmp".into(),
        format!("unix:{},server,nowait", qmp.display()),
    ];

    for disk in &kvm.disk_paths {
        let mut drive = format!("file={},media=disk", disk.display());
        if common.snapshot {
            drive.push_str(",snapshot=on");
        }
        args.push("-drive".into());
        args.push(drive);
    }

    if let Some(kernel) = &kvm.kernel_path {
        args.push("-kernel".into());
        args.push(kernel.display().to_string());
    }
    if let Some(initrd) = &kvm.initrd_path {
        args.push("-initrd".into());
        args.push(initrd.display().to_string());
    }
    if let Some(append) = &kvm.append {
        args.push("-append".into());
        args.push(append.clone());
    }

    // the cdrom slot always exists so media can be changed later
    let mut cdrom = String::from("if=ide,index=1,media=cdrom");
    if let Some(path) = &kvm.cdrom_path {
        cdrom = format!("file={},{}", path.display(), cdrom);
    }
    args.push("-drive".into());
    args.push(cdrom);

    if let Some(migrate) = &kvm.migrate_path {
        args.push("-incoming".into());
        args.push(format!("exec:cat {}", migrate.display()));
    }

    for (position, net) in base.networks().iter().enumerate() {
        if net.tap.is_empty() {
            continue;
        }
        args.push("-netdev".into());
        args.push(format!(
            "tap,id=net{},ifname={},script=no,downscript=no",
            position, net.tap
        ));
        args.push("-device".into());
        args.push(format!("{},netdev=net{},mac={}", net.driver, position, net.mac));
    }

    args.extend(kvm.qemu_append.iter().cloned());
    args
}

fn hmp_failed(operation: &str, output: String) -> FleetError {
    FleetError::operation_failed(operation, output)
}

pub struct KvmVm {
    base: BaseVm,
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
    qmp: LazyQmp,
    /// Hotplugged disks by hotplug id
    hotplug: Mutex<BTreeMap<u32, PathBuf>>,
}

impl KvmVm {
    pub fn new(
        base: BaseVm,
        executor: Arc<dyn CommandExecutor>,
        bridges: Arc<dyn BridgeManager>,
        connector: Arc<dyn QmpConnector>,
    ) -> Self {
        let socket = base.instance_path().join(QMP_SOCKET);
        Self {
            base,
            executor,
            bridges,
            qmp: LazyQmp::new(socket, connector),
            hotplug: Mutex::new(BTreeMap::new()),
        }
    }

    fn assign_macs(&self) -> FleetResult<()> {
        for (position, net) in self.base.networks().iter().enumerate() {
            if net.mac.is_empty() {
                self.base.set_mac(position, &random_mac())?;
            }
        }
        Ok(())
    }

    async fn bring_up(&self) -> FleetResult<Child> {
        self.assign_macs()?;
        attach_networks(&self.base, self.bridges.as_ref()).await?;

        let args = build_args(&self.base);
        debug!("vm {} hypervisor args: {:?}", self.base.id(), args);

        let (child, pid) = self
            .executor
            .spawn("qemu", &args, Some(self.base.instance_path()))
            .await
            .map_err(|e| exec_error("launch", "qemu", e))?;

        info!("vm {} hypervisor running as pid {}", self.base.id(), pid);
        Ok(child)
    }

    /// Sends operator-supplied QMP JSON and returns the raw reply
    pub async fn qmp_raw(&self, json: &str) -> FleetResult<String> {
        self.base.check_state("qmp", live())?;
        self.qmp.channel().await?.raw(json).await
    }

    /// Runs one structured QMP command
    pub async fn qmp_execute(&self, command: &str, arguments: Option<Value>) -> FleetResult<Value> {
        self.qmp.execute(command, arguments).await
    }

    /// Attaches `disk` as a USB storage device and returns its hotplug id
    #[instrument(skip(self), fields(vm_id = %self.base.id()))]
    pub async fn hotplug_add(&self, disk: &Path) -> FleetResult<u32> {
        self.base.check_state("hotplug", live())?;

        let id = {
            let mut hotplug = self.hotplug.lock();
            let id = hotplug.keys().next_back().map_or(0, |last| last + 1);
            hotplug.insert(id, disk.to_path_buf());
            id
        };

        if let Err(e) = self.hotplug_attach(id, disk).await {
            self.hotplug.lock().remove(&id);
            return Err(e);
        }
        info!("hotplugged {} as hotplug{}", disk.display(), id);
        Ok(id)
    }

    async fn hotplug_attach(&self, id: u32, disk: &Path) -> FleetResult<()> {
        let drive = format!("hotplug{}", id);

        let output = self
            .qmp
            .hmp(&format!(
                "drive_add 0 file={},if=none,id={},format=raw",
                disk.display(),
                drive
            ))
            .await?;
        if !output.contains("OK") {
            return Err(hmp_failed("hotplug", output));
        }

        let output = self
            .qmp
            .hmp(&format!("device_add usb-storage,id={},drive={}", drive, drive))
            .await?;
        if !output.is_empty() {
            return Err(hmp_failed("hotplug", output));
        }
        Ok(())
    }

    /// Detaches a hotplugged disk
    #[instrument(skip(self), fields(vm_id = %self.base.id()))]
    pub async fn hotplug_remove(&self, id: u32) -> FleetResult<()> {
        self.base.check_state("hotplug", live())?;

        if !self.hotplug.lock().contains_key(&id) {
            return Err(FleetError::DiskNotFound {
                disk: format!("hotplug{}", id),
            });
        }

        let output = self.qmp.hmp(&format!("device_del hotplug{}", id)).await?;
        if !output.is_empty() {
            return Err(hmp_failed("hotplug remove", output));
        }
        self.hotplug.lock().remove(&id);
        Ok(())
    }

    /// Hotplugged disks, by id
    pub fn hotplug_list(&self) -> BTreeMap<u32, PathBuf> {
        self.hotplug.lock().clone()
    }

    pub async fn cdrom_change(&self, path: &Path) -> FleetResult<()> {
        self.base.check_state("cdrom", live())?;
        let output = self
            .qmp
            .hmp(&format!("change {} {}", CDROM_DEVICE, path.display()))
            .await?;
        if !output.is_empty() {
            return Err(hmp_failed("cdrom change", output));
        }
        Ok(())
    }

    pub async fn cdrom_eject(&self) -> FleetResult<()> {
        self.base.check_state("cdrom", live())?;
        let output = self.qmp.hmp(&format!("eject -f {}", CDROM_DEVICE)).await?;
        if !output.is_empty() {
            return Err(hmp_failed("cdrom eject", output));
        }
        Ok(())
    }
}

#[async_trait]
impl Vm for KvmVm {
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
        self.qmp.execute("cont", None).await?;
        self.base.set_state_if(VmState::PAUSED, VmState::RUNNING);
        Ok(())
    }

    async fn stop(&self) -> FleetResult<()> {
        self.base.check_state("stop", VmState::RUNNING)?;
        self.qmp.execute("stop", None).await?;
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

impl VmVariant for KvmVm {
    const KIND: VmKind = VmKind::Kvm;
}

/// Creates hypervisor-backed VMs
pub struct KvmFactory {
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
    connector: Arc<dyn QmpConnector>,
}

impl KvmFactory {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        bridges: Arc<dyn BridgeManager>,
        connector: Arc<dyn QmpConnector>,
    ) -> Self {
        Self {
            executor,
            bridges,
            connector,
        }
    }
}

impl VmFactory for KvmFactory {
    fn kind(&self) -> VmKind {
        VmKind::Kvm
    }

    fn description(&self) -> &'static str {
        "Hypervisor process controlled over QMP"
    }

    fn create(&self, base: BaseVm) -> FleetResult<Arc<dyn Vm>> {
        Ok(Arc::new(KvmVm::new(
            base,
            self.executor.clone(),
            self.bridges.clone(),
            self.connector.clone(),
        )))
    }
}
