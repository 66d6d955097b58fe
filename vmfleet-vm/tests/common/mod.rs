// Common test utilities for the VM variant integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command as ProcessCommand};

use vmfleet_core::network::InMemoryBridges;
use vmfleet_core::{
    Command, ConfigBuilder, FleetResult, Response, SharedNodeState, Vm,
    VmFactoryRegistry, VmState,
};
use vmfleet_vm::kvm::KvmFactory;
use vmfleet_vm::process_manager::{CommandExecutor, CommandOutput};
use vmfleet_vm::qmp::{QmpChannel, QmpConnector};
use vmfleet_vm::{register_handlers, ContainerFactory};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How spawned "VM processes" behave
#[derive(Clone, Copy)]
pub enum ProcessMode {
    /// Runs until killed
    Forever,
    /// Exits by itself with this code
    Exit(i32),
    /// The executable does not exist
    Missing,
}

/// Stands in for the real executables. Spawns shell processes instead of
/// hypervisors and records every invocation.
pub struct ScriptedExecutor {
    pub mode: Mutex<ProcessMode>,
    pub spawned: Mutex<Vec<(String, Vec<String>)>>,
    pub pids: Mutex<Vec<u32>>,
    pub killed: Mutex<Vec<u32>>,
}

impl ScriptedExecutor {
    pub fn new(mode: ProcessMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            spawned: Mutex::new(Vec::new()),
            pids: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        })
    }

    pub fn last_spawn(&self) -> (String, Vec<String>) {
        self.spawned.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, _program: &str, _args: &[String]) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        _cwd: Option<&Path>,
    ) -> io::Result<(Child, u32)> {
        self.spawned
            .lock()
            .push((program.to_string(), args.to_vec()));

        let script = match *self.mode.lock() {
            ProcessMode::Forever => "exec sleep 30".to_string(),
            ProcessMode::Exit(code) => format!("exit {}", code),
            ProcessMode::Missing => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "No such file"))
            }
        };

        let child = ProcessCommand::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        self.pids.lock().push(pid);
        Ok((child, pid))
    }

    async fn kill(&self, pid: u32) -> io::Result<()> {
        self.killed.lock().push(pid);
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }
}

/// Answers QMP like an idle hypervisor and records each command
#[derive(Default)]
pub struct MockQmp {
    pub commands: Mutex<Vec<String>>,
}

impl MockQmp {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl QmpChannel for MockQmp {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> FleetResult<Value> {
        let line = match arguments
            .as_ref()
            .and_then(|a| a.get("command-line"))
            .and_then(Value::as_str)
        {
            Some(hmp) => hmp.to_string(),
            None => command.to_string(),
        };
        self.commands.lock().push(line.clone());

        if line.starts_with("drive_add") {
            return Ok(json!("OK\r\n"));
        }
        if command == "human-monitor-command" {
            return Ok(json!(""));
        }
        Ok(json!({}))
    }

    async fn raw(&self, json: &str) -> FleetResult<String> {
        self.commands.lock().push(json.to_string());
        Ok(r#"{"return": {"status": "running"}}"#.to_string())
    }
}

pub struct MockConnector(pub Arc<MockQmp>);

#[async_trait]
impl QmpConnector for MockConnector {
    async fn connect(&self, _socket: &Path) -> FleetResult<Arc<dyn QmpChannel>> {
        Ok(self.0.clone())
    }
}

pub struct TestNode {
    pub node: SharedNodeState,
    pub executor: Arc<ScriptedExecutor>,
    pub bridges: Arc<InMemoryBridges>,
    pub qmp: Arc<MockQmp>,
    pub cgroup_root: PathBuf,
    _dir: TempDir,
}

impl TestNode {
    pub fn new(mode: ProcessMode) -> Self {
        let dir = TempDir::new().unwrap();
        let cgroup_root = dir.path().join("cgroup");
        let config = ConfigBuilder::new()
            .hostname("node1")
            .base_dir(dir.path().join("instances"))
            .build()
            .unwrap();

        let executor = ScriptedExecutor::new(mode);
        let bridges = Arc::new(InMemoryBridges::with_bridges(["mega_bridge"]));
        let qmp = Arc::new(MockQmp::default());

        let mut factories = VmFactoryRegistry::new();
        factories.register(Arc::new(KvmFactory::new(
            executor.clone(),
            bridges.clone(),
            Arc::new(MockConnector(qmp.clone())),
        )));
        factories.register(Arc::new(ContainerFactory::new(
            executor.clone(),
            bridges.clone(),
            cgroup_root.clone(),
        )));

        let node = SharedNodeState::new(config, factories, bridges.clone()).unwrap();
        register_handlers(&node);

        Self {
            node,
            executor,
            bridges,
            qmp,
            cgroup_root,
            _dir: dir,
        }
    }

    pub async fn run(&self, cmd: Command) -> Response {
        self.node.process(&cmd).await
    }

    pub async fn config(&self, field: &str, values: &[&str]) {
        let resp = self
            .run(Command::new("vm config").arg("field", field).list("value", values.iter().copied()))
            .await;
        assert!(resp.error.is_none(), "{:?}", resp.error);
    }

    pub async fn launch(&self, kind: &str, names: &str) -> Response {
        self.run(Command::new("vm launch").arg("kind", kind).arg("name", names))
            .await
    }

    pub fn vm(&self, name: &str) -> Arc<dyn Vm> {
        self.node.registry().find(name).unwrap()
    }
}

/// Polls until the VM reaches `state`
pub async fn wait_for_state(vm: &Arc<dyn Vm>, state: VmState) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while vm.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("vm {} stuck in {}, wanted {}", vm.name(), vm.state(), state));
}

pub fn is_wrong_variant(error: &str) -> bool {
    error.contains("vm is not a kvm")
}
