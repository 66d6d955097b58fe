mod common;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use common::{launch, test_node};
use vmfleet_core::target::{apply, KILL_MASK};
use vmfleet_core::{Command, FleetError, VmState};

#[tokio::test]
async fn test_batch_with_some_failures_reports_every_target() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);
    launch(&node, "vm[1-5]").await;

    // vm2 and vm4 become unkillable
    for name in ["vm2", "vm4"] {
        node.registry()
            .find(name)
            .unwrap()
            .base()
            .set_state(VmState::ERROR);
    }

    let outcomes = apply(node.registry(), "vm[1-5]", KILL_MASK, |vm| async move {
        vm.kill()
    })
    .await
    .unwrap();

    assert_eq!(outcomes.len(), 5);
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.is_ok())
        .map(|o| o.target.as_str())
        .collect();
    assert_eq!(failed, vec!["vm2", "vm4"]);
    assert!(outcomes
        .iter()
        .filter(|o| !o.is_ok())
        .all(|o| matches!(o.result, Err(FleetError::InvalidState { .. }))));

    for name in ["vm1", "vm3", "vm5"] {
        assert!(node
            .registry()
            .find(name)
            .unwrap()
            .state()
            .intersects(VmState::QUITTING | VmState::QUIT));
    }
}

#[tokio::test]
async fn test_batch_command_joins_errors() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);
    launch(&node, "a").await;

    let resp = node
        .process(&Command::new("vm stop").arg("target", "a,b,c"))
        .await;

    assert_eq!(resp.tabular.len(), 3);
    assert_eq!(
        resp.error.as_deref(),
        Some("vm not found: b\nvm not found: c")
    );
    assert_eq!(node.registry().find("a").unwrap().state(), VmState::PAUSED);
}

#[tokio::test]
async fn test_wildcard_start_only_touches_paused() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);
    launch(&node, "a,b,c").await;
    node.process(&Command::new("vm stop").arg("target", "b")).await;

    let resp = node
        .process(&Command::new("vm start").arg("target", "all"))
        .await;

    assert_eq!(resp.tabular, vec![vec!["b".to_string(), "started".to_string()]]);
    assert!(resp.error.is_none());
}

#[tokio::test]
async fn test_malformed_target_is_a_single_error() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);
    launch(&node, "a").await;

    let resp = node
        .process(&Command::new("vm kill").arg("target", "a[1-"))
        .await;

    assert!(resp.tabular.is_empty());
    assert!(resp.error.unwrap().starts_with("invalid target"));
    assert_eq!(node.registry().find("a").unwrap().state(), VmState::RUNNING);
}

#[tokio::test]
async fn test_malformed_connect_target_allocates_no_vlan() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);

    let resp = node
        .process(
            &Command::new("vm net connect")
                .arg("target", "web[1-")
                .arg("position", "0")
                .arg("vlan", "lan9"),
        )
        .await;

    assert!(resp.error.unwrap().starts_with("invalid target"));
    assert!(node.vlans().aliases(None).is_empty());
}

#[tokio::test]
async fn test_bad_netspec_list_stages_and_allocates_nothing() {
    let dir = TempDir::new().unwrap();
    let node = test_node("node1", &dir);

    let resp = node
        .process(
            &Command::new("vm config")
                .arg("field", "net")
                .list("value", ["red", "br0,blue,zz:zz:zz:zz:zz:zz"]),
        )
        .await;

    assert!(resp.error.unwrap().contains("malformed netspec"));
    assert!(node.vlans().aliases(None).is_empty());
    assert!(node.registry().staged().base.networks.is_empty());
}
