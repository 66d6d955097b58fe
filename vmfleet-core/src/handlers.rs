//! Built-in command handlers
//!
//! Each handler runs with the command lock held. Batch commands answer with
//! one row per target and join every per-target failure into the response
//! error, so one bad target never hides the others.

use std::fmt::Display;
use std::sync::Arc;
use tracing::info;

use crate::command::{Command, Response, ResponseData};
use crate::error::{format_errors, FleetError, FleetResult};
use crate::metrics::names;
use crate::network::{parse_netspecs, ALIAS_SEP};
use crate::node_shared::SharedNodeState;
use crate::registry::LaunchOutcome;
use crate::target::{
    apply, check_target, expand_launch_names, TargetOutcome, KILL_MASK, START_MASK, STOP_MASK,
    TAG_MASK,
};
use crate::types::{VmInfo, VmKind, INFO_COLUMNS, SUMMARY_COLUMNS};
use crate::vm::Vm;
use crate::vm_config::CONFIG_FIELDS;

fn header(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

/// One `target`, `status` row per outcome; failures land in the error
pub fn batch_response<T: Display>(label: &str, outcomes: Vec<TargetOutcome<T>>) -> Response {
    let mut rows = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();

    for outcome in outcomes {
        match outcome.result {
            Ok(value) => rows.push(vec![outcome.target, value.to_string()]),
            Err(e) => {
                rows.push(vec![outcome.target, e.to_string()]);
                errors.push(e);
            }
        }
    }

    let mut response = Response::new("").table(header(&["target", label]), rows);
    if !errors.is_empty() {
        response.error = Some(format_errors(&errors));
    }
    response
}

fn launch_response(outcomes: Vec<LaunchOutcome>) -> Response {
    let outcomes = outcomes
        .into_iter()
        .map(|o| TargetOutcome {
            target: o.name,
            result: o.result,
        })
        .collect();
    batch_response("id", outcomes)
}

fn info_table(infos: &[VmInfo], columns: &[&str]) -> FleetResult<Vec<Vec<String>>> {
    infos
        .iter()
        .map(|info| columns.iter().map(|c| info.column(c)).collect())
        .collect()
}

fn parse_position(cmd: &Command) -> FleetResult<usize> {
    let position = cmd.require("position")?;
    position
        .parse()
        .map_err(|_| FleetError::invalid_input("position", format!("not a number: {}", position)))
}

/// Dispatches a command to the matching built-in handler
pub(crate) async fn builtin(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    match cmd.pattern.as_str() {
        "vm info" => vm_info(node, cmd, INFO_COLUMNS),
        "vm summary" => vm_info(node, cmd, SUMMARY_COLUMNS),
        "vm launch" => vm_launch(node, cmd).await,
        "vm start" => {
            let outcomes = apply(node.registry(), cmd.require("target")?, START_MASK, |vm| async move {
                vm.start().await.map(|()| "started")
            })
            .await?;
            Ok(batch_response("status", outcomes))
        }
        "vm stop" => {
            let outcomes = apply(node.registry(), cmd.require("target")?, STOP_MASK, |vm| async move {
                vm.stop().await.map(|()| "paused")
            })
            .await?;
            Ok(batch_response("status", outcomes))
        }
        "vm kill" => vm_kill(node, cmd).await,
        "vm flush" => {
            let flushed = node.registry().flush().await;
            let rows = flushed.iter().map(|id| vec![id.to_string()]).collect();
            Ok(Response::new("").table(header(&["flushed"]), rows))
        }
        "vm tag" => vm_tag(node, cmd).await,
        "clear vm tag" => clear_vm_tag(node, cmd).await,
        "vm net connect" => vm_net_connect(node, cmd).await,
        "vm net disconnect" => vm_net_disconnect(node, cmd).await,
        "vm config" => vm_config(node, cmd),
        "vm config save" => {
            match cmd.string_arg("name") {
                Some(name) => node.registry().save_config(name),
                None => {
                    let rows = node
                        .registry()
                        .saved_configs()
                        .into_iter()
                        .map(|name| vec![name])
                        .collect();
                    return Ok(Response::new("").table(header(&["config"]), rows));
                }
            }
            Ok(Response::new(""))
        }
        "vm config restore" => {
            node.registry().restore_config(cmd.require("name")?)?;
            Ok(Response::new(""))
        }
        "clear vm config" => {
            node.registry().clear_staged();
            Ok(Response::new(""))
        }
        "namespace" => namespace(node, cmd),
        "clear namespace" => clear_namespace(node, cmd),
        "vlans" => vlans(node),
        "metrics" => {
            let snapshot = node.metrics().snapshot();
            Ok(Response::new("").table(header(&["name", "value"]), snapshot.rows()))
        }
        other => Err(FleetError::invalid_input(
            "command",
            format!("unknown command: {}", other),
        )),
    }
}

fn vm_info(node: &SharedNodeState, cmd: &Command, default_columns: &[&str]) -> FleetResult<Response> {
    node.registry().refresh_bandwidth(node.bandwidth());
    let infos = node.registry().info();

    let requested: Vec<&str> = cmd.list_arg("columns").iter().map(String::as_str).collect();
    let columns = if requested.is_empty() {
        default_columns
    } else {
        requested.as_slice()
    };

    let rows = info_table(&infos, columns)?;
    Ok(Response::new("")
        .table(header(columns), rows)
        .data(ResponseData::Vms(infos)))
}

async fn vm_launch(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let kind: VmKind = cmd.require("kind")?.parse()?;
    let names = expand_launch_names(cmd.require("name")?)?;
    let count = names.len();

    let results = node.registry().launch(names, kind)?;

    if cmd.bool_arg("noblock") {
        results.detach();
        return Ok(Response::new("").text(format!("launching {} {} vms", count, kind)));
    }

    Ok(launch_response(results.collect().await))
}

async fn vm_kill(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let outcomes = apply(node.registry(), cmd.require("target")?, KILL_MASK, |vm| {
        let metrics = node.metrics().clone();
        async move {
            vm.kill().map(|()| {
                metrics.increment_counter(names::VM_KILLED);
                "killed"
            })
        }
    })
    .await?;
    Ok(batch_response("status", outcomes))
}

fn render_tags(vm: &Arc<dyn Vm>) -> String {
    let pairs: Vec<String> = vm
        .base()
        .tags()
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect();
    format!("map[{}]", pairs.join(" "))
}

async fn vm_tag(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let target = cmd.require("target")?;
    let key = cmd.string_arg("key");
    let value = cmd.string_arg("value");

    let outcomes = apply(node.registry(), target, TAG_MASK, |vm| async move {
        let rendered = match (key, value) {
            (Some(key), Some(value)) => {
                vm.base().set_tag(key, value);
                value.to_string()
            }
            (Some(key), None) => vm.base().tag(key).unwrap_or_default(),
            (None, _) => render_tags(&vm),
        };
        Ok(rendered)
    })
    .await?;

    Ok(batch_response(key.unwrap_or("tags"), outcomes))
}

async fn clear_vm_tag(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let key = cmd.string_arg("key");
    let outcomes = apply(node.registry(), cmd.require("target")?, TAG_MASK, |vm| async move {
        match key {
            Some(key) => {
                vm.base().clear_tag(key);
            }
            None => vm.base().clear_tags(),
        }
        Ok("cleared")
    })
    .await?;
    Ok(batch_response("status", outcomes))
}

async fn vm_net_connect(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let target = cmd.require("target")?;
    check_target(target)?;
    let position = parse_position(cmd)?;
    let bridge = cmd
        .string_arg("bridge")
        .unwrap_or(node.net_defaults().bridge.as_str())
        .to_string();
    let vlan = node.vlans().parse_vlan(&node.namespace(), cmd.require("vlan")?)?;

    let outcomes = apply(node.registry(), target, TAG_MASK, |vm| {
        let bridges = node.bridges().clone();
        let bridge = bridge.clone();
        async move {
            vm.base()
                .network_connect(position, &bridge, vlan, bridges.as_ref())
                .await
                .map(|()| format!("{},{}", bridge, vlan))
        }
    })
    .await?;
    Ok(batch_response("network", outcomes))
}

async fn vm_net_disconnect(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let position = parse_position(cmd)?;
    let outcomes = apply(node.registry(), cmd.require("target")?, TAG_MASK, |vm| {
        let bridges = node.bridges().clone();
        async move {
            vm.base()
                .network_disconnect(position, bridges.as_ref())
                .await
                .map(|()| "disconnected")
        }
    })
    .await?;
    Ok(batch_response("network", outcomes))
}

fn vm_config(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let registry = node.registry();

    let Some(field) = cmd.string_arg("field") else {
        let staged = registry.staged();
        let rows = CONFIG_FIELDS
            .iter()
            .map(|field| staged.field(field).map(|value| vec![field.to_string(), value]))
            .collect::<FleetResult<Vec<_>>>()?;
        return Ok(Response::new("").table(header(&["field", "value"]), rows));
    };

    let values = cmd.list_arg("value");
    if values.is_empty() {
        return Ok(Response::new("").text(registry.staged().field(field)?));
    }

    if field == "net" {
        let namespace = node.namespace();
        let networks = parse_netspecs(values, &namespace, node.vlans(), node.net_defaults())?;
        registry.update_staged(|cfg| {
            cfg.base.networks = networks;
            Ok(())
        })?;
    } else {
        registry.update_staged(|cfg| cfg.set_field(field, values))?;
    }

    Ok(Response::new(""))
}

fn namespace(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    match cmd.string_arg("name") {
        Some(name) => {
            node.registry().set_namespace(Some(name.to_string()));
            Ok(Response::new(""))
        }
        None => Ok(Response::new("").text(node.namespace())),
    }
}

fn clear_namespace(node: &SharedNodeState, cmd: &Command) -> FleetResult<Response> {
    let Some(name) = cmd.string_arg("name") else {
        node.registry().set_namespace(None);
        return Ok(Response::new(""));
    };

    if node.registry().namespace().as_deref() == Some(name) {
        node.registry().set_namespace(None);
    }
    let released = node.vlans().delete_namespace(name);
    info!("cleared namespace {}, {} vlan aliases released", name, released);
    Ok(Response::new("").text(format!("released {} vlan aliases", released)))
}

fn vlans(node: &SharedNodeState) -> FleetResult<Response> {
    let active = node.registry().namespace();
    let rows = node
        .vlans()
        .aliases(active.as_deref())
        .into_iter()
        .map(|(alias, vlan)| {
            let (namespace, alias) = alias
                .split_once(ALIAS_SEP)
                .map(|(ns, a)| (ns.to_string(), a.to_string()))
                .unwrap_or_else(|| (String::new(), alias.clone()));
            vec![namespace, alias, vlan.to_string()]
        })
        .collect();
    Ok(Response::new("").table(header(&["namespace", "alias", "vlan"]), rows))
}
