//! External process execution and VM process monitoring

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmfleet_core::config::ExternalProcesses;
use vmfleet_core::network::BridgeManager;
use vmfleet_core::vm::{release_networks, Vm};
use vmfleet_core::{FleetError, FleetResult, VmId, VmState};

/// How long a process gets to exit after SIGTERM before it is SIGKILLed
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Trait for executing commands - allows mocking in tests.
///
/// `program` is a logical name (`qemu`, `ovs`, `ip`, `unshare`); the
/// executor decides which binary that is.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> io::Result<(Child, u32)>;

    async fn kill(&self, pid: u32) -> io::Result<()>;
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs the real executables named in the `[external]` config section
pub struct SystemCommandExecutor {
    external: ExternalProcesses,
}

impl SystemCommandExecutor {
    pub fn new(external: ExternalProcesses) -> Self {
        Self { external }
    }

    fn command(&self, program: &str, args: &[String]) -> io::Result<Command> {
        let binary = self
            .external
            .binary(program)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        let mut cmd = Command::new(binary);
        cmd.args(args);
        Ok(cmd)
    }
}

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let mut cmd = self.command(program, args)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("executing {} {:?}", program, args);
        let output = cmd.output().await?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> io::Result<(Child, u32)> {
        let mut cmd = self.command(program, args)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "Failed to get process ID")
        })?;

        Ok((child, pid))
    }

    async fn kill(&self, pid: u32) -> io::Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }
}

/// Maps a failure to start an external program onto the error taxonomy.
///
/// A missing executable is an environment problem, reported per call.
pub fn exec_error(operation: &str, program: &str, e: io::Error) -> FleetError {
    if e.kind() == io::ErrorKind::NotFound {
        FleetError::Environment {
            details: format!("{} not available: {}", program, e),
        }
    } else {
        FleetError::operation_failed(operation, format!("{}: {}", program, e))
    }
}

/// Runs a program to completion and fails on a non-zero exit
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    operation: &str,
    program: &str,
    args: &[String],
) -> FleetResult<CommandOutput> {
    let output = executor
        .execute(program, args)
        .await
        .map_err(|e| exec_error(operation, program, e))?;

    if !output.status.success() {
        return Err(FleetError::operation_failed(
            operation,
            format!("{} {}: {}", program, args.join(" "), output.stderr_lossy()),
        ));
    }
    Ok(output)
}

/// Stops a VM process: SIGTERM through the executor, then SIGKILL if the
/// signal could not be sent or the process outlives [`KILL_GRACE`].
async fn terminate(executor: &dyn CommandExecutor, child: &mut Child, vm_id: VmId) {
    if let Some(pid) = child.id() {
        match executor.kill(pid).await {
            Ok(()) => match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!("vm {}: process {} outlived SIGTERM", vm_id, pid),
            },
            Err(e) => warn!("vm {}: signal process {}: {}", vm_id, pid, e),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("vm {}: kill process: {}", vm_id, e);
    }
}

/// Watches a VM's process until it exits or the VM is killed.
///
/// On kill the child is terminated and the VM moves to QUIT. On exit the VM
/// moves to QUIT after a clean exit and ERROR otherwise, unless a kill had
/// already started. Either way the VM's taps are destroyed and the
/// termination is acknowledged.
pub fn monitor_process<V: Vm>(
    vm: Arc<V>,
    mut child: Child,
    executor: Arc<dyn CommandExecutor>,
    bridges: Arc<dyn BridgeManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let base = vm.base();

        tokio::select! {
            _ = base.kill_signal().fired() => {
                terminate(executor.as_ref(), &mut child, base.id()).await;
                base.set_state_if(VmState::KILLABLE, VmState::QUIT);
            }
            status = child.wait() => {
                let clean = matches!(&status, Ok(s) if s.success());
                match &status {
                    Ok(s) => info!("vm {} process exited: {}", base.id(), s),
                    Err(e) => warn!("vm {} wait: {}", base.id(), e),
                }
                if !base.set_state_if(VmState::QUITTING, VmState::QUIT) {
                    let next = if clean { VmState::QUIT } else { VmState::ERROR };
                    base.set_state_if(VmState::KILLABLE, next);
                }
            }
        }

        release_networks(base, bridges.as_ref()).await;
        base.ack_kill();
        debug!("vm {} monitor finished in state {}", base.id(), base.state());
    })
}
