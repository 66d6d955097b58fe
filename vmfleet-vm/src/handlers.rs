//! Commands only hypervisor-backed VMs understand

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use vmfleet_core::handlers::batch_response;
use vmfleet_core::{
    apply, Command, CommandHandler, FleetError, FleetResult, Response, SharedNodeState, Vm,
    VmKind, VmState,
};

use crate::kvm::KvmVm;

fn as_kvm(vm: Arc<dyn Vm>) -> FleetResult<Arc<KvmVm>> {
    let name = vm.name().to_string();
    vm.into_any()
        .downcast::<KvmVm>()
        .map_err(|_| FleetError::WrongVariant {
            id_or_name: name,
            expected: VmKind::Kvm,
        })
}

async fn cdrom_change(vm: Arc<dyn Vm>, path: PathBuf) -> FleetResult<&'static str> {
    as_kvm(vm)?.cdrom_change(&path).await.map(|()| "changed")
}

async fn cdrom_eject(vm: Arc<dyn Vm>) -> FleetResult<&'static str> {
    as_kvm(vm)?.cdrom_eject().await.map(|()| "ejected")
}

/// `vm qmp`, `vm hotplug ...` and `vm cdrom ...`
pub struct KvmHandler;

impl KvmHandler {
    async fn hotplug_remove(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
        let vm = node.registry().find_variant::<KvmVm>(cmd.require("target")?)?;
        let id = cmd.require("id")?;

        let ids: Vec<u32> = if id == vmfleet_core::WILDCARD {
            vm.hotplug_list().into_keys().collect()
        } else {
            vec![id
                .parse()
                .map_err(|_| FleetError::DiskNotFound { disk: id.to_string() })?]
        };

        for id in ids {
            vm.hotplug_remove(id).await?;
        }
        Ok(Response::new(""))
    }
}

#[async_trait]
impl CommandHandler for KvmHandler {
    fn patterns(&self) -> Vec<&'static str> {
        vec![
            "vm qmp",
            "vm hotplug add",
            "vm hotplug remove",
            "vm hotplug show",
            "vm cdrom change",
            "vm cdrom eject",
        ]
    }

    async fn handle(&self, node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
        let live = VmState::RUNNING | VmState::PAUSED;

        match cmd.pattern.as_str() {
            "vm qmp" => {
                let vm = node.registry().find_variant::<KvmVm>(cmd.require("target")?)?;
                let reply = vm.qmp_raw(cmd.require("json")?).await?;
                Ok(Response::new("").text(reply))
            }
            "vm hotplug add" => {
                let vm = node.registry().find_variant::<KvmVm>(cmd.require("target")?)?;
                let id = vm.hotplug_add(&PathBuf::from(cmd.require("file")?)).await?;
                Ok(Response::new("").text(id.to_string()))
            }
            "vm hotplug remove" => Self::hotplug_remove(node, cmd).await,
            "vm hotplug show" => {
                let vm = node.registry().find_variant::<KvmVm>(cmd.require("target")?)?;
                let rows = vm
                    .hotplug_list()
                    .into_iter()
                    .map(|(id, file)| vec![id.to_string(), file.display().to_string()])
                    .collect();
                Ok(Response::new("").table(vec!["hotplug".into(), "file".into()], rows))
            }
            "vm cdrom change" => {
                let path = PathBuf::from(cmd.require("file")?);
                let outcomes = apply(node.registry(), cmd.require("target")?, live, |vm| {
                    cdrom_change(vm, path.clone())
                })
                .await?;
                Ok(batch_response("cdrom", outcomes))
            }
            "vm cdrom eject" => {
                let outcomes =
                    apply(node.registry(), cmd.require("target")?, live, cdrom_eject).await?;
                Ok(batch_response("cdrom", outcomes))
            }
            other => Err(FleetError::invalid_input(
                "command",
                format!("unknown command: {}", other),
            )),
        }
    }
}
