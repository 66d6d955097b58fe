mod common;

use pretty_assertions::assert_eq;
use std::fs;

use common::{ProcessMode, TestNode, TEST_TIMEOUT};
use vmfleet_core::{Command, VmState};
use vmfleet_vm::container::{CGROUP_PROCS, FREEZER_STATE};

#[tokio::test]
async fn test_container_requires_filesystem() {
    let t = TestNode::new(ProcessMode::Forever);

    let resp = t.launch("container", "ct").await;
    assert!(resp.error.unwrap().contains("root filesystem"));
    assert_eq!(t.vm("ct").state(), VmState::ERROR);
    assert!(t.executor.spawned.lock().is_empty());
}

#[tokio::test]
async fn test_container_lifecycle_through_freezer() {
    let t = TestNode::new(ProcessMode::Forever);
    t.config("filesystem", &["/srv/rootfs"]).await;
    t.config("init", &["/sbin/init", "--quiet"]).await;

    let resp = t.launch("container", "ct").await;
    assert!(resp.error.is_none(), "{:?}", resp.error);

    let (program, args) = t.executor.last_spawn();
    assert_eq!(program, "unshare");
    assert!(args.contains(&"--root=/srv/rootfs".to_string()));
    assert_eq!(&args[args.len() - 2..], &["/sbin/init".to_string(), "--quiet".to_string()]);

    let cgroup = t.cgroup_root.join("0");
    let pid = fs::read_to_string(cgroup.join(CGROUP_PROCS)).unwrap();
    assert!(pid.parse::<u32>().unwrap() > 0);

    t.run(Command::new("vm stop").arg("target", "ct")).await;
    assert_eq!(t.vm("ct").state(), VmState::PAUSED);
    assert_eq!(fs::read_to_string(cgroup.join(FREEZER_STATE)).unwrap(), "FROZEN");

    t.run(Command::new("vm start").arg("target", "ct")).await;
    assert_eq!(t.vm("ct").state(), VmState::RUNNING);
    assert_eq!(fs::read_to_string(cgroup.join(FREEZER_STATE)).unwrap(), "THAWED");

    let mut acks = t.node.registry().subscribe_kill_acks();
    t.run(Command::new("vm kill").arg("target", "ct")).await;
    tokio::time::timeout(TEST_TIMEOUT, acks.recv())
        .await
        .unwrap()
        .unwrap();

    // the freezer files are plain files here, so clear them before rmdir
    fs::remove_file(cgroup.join(CGROUP_PROCS)).unwrap();
    fs::remove_file(cgroup.join(FREEZER_STATE)).unwrap();

    let flush = t.run(Command::new("vm flush")).await;
    assert_eq!(flush.tabular.len(), 1);
    assert!(!cgroup.exists());
    assert!(t.node.registry().is_empty());
}
