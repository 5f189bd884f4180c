//! Per-domain backend process supervision
//!
//! A [`BackendSupervisor`] owns at most one child process for its domain.
//! Its lifecycle is a small state machine:
//!
//! ```text
//! Idle | Exited | SpawnFailed --restart--> Starting
//! Starting --spawn ok--> Running
//! Starting --spawn error--> SpawnFailed          (no automatic retry)
//! Running --process exit--> Exited --delay--> Starting
//! any --stop--> Stopped
//! ```
//!
//! Every restart bumps a generation counter. Only the exit of the current
//! generation schedules the delayed restart, so killing a superseded child
//! never causes a second restart. The delayed restart is also dropped when
//! any other restart happens before it fires: an explicit restart during
//! the delay window replaces it rather than being followed by it.

use crate::config::LauncherConfig;
use crate::error::SupervisorError;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between a backend exit and its automatic restart
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(5000);

/// How long a terminated child gets to exit before it is killed outright
const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Desired launch parameters for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub domain: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub port: u16,
}

impl ServiceDescriptor {
    fn launches_same(&self, command: &str, args: &[String], working_dir: &Path, port: u16) -> bool {
        self.command == command
            && self.args == args
            && self.working_dir == working_dir
            && self.port == port
    }
}

/// Lifecycle state of a supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No process has been started yet
    Idle,
    /// A spawn is in progress
    Starting,
    /// The child process is alive
    Running,
    /// The child exited; a restart is scheduled
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The last spawn attempt failed; waits for an explicit trigger
    SpawnFailed,
    /// Stopped on shutdown; no restart is scheduled
    Stopped,
}

/// Settings shared by every supervisor in a registry
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Environment variable carrying the assigned port
    pub port_env: String,
    /// Fixed delay before restarting an exited backend
    pub restart_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            port_env: "PORT".to_string(),
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl From<&LauncherConfig> for SupervisorSettings {
    fn from(launcher: &LauncherConfig) -> Self {
        Self {
            port_env: launcher.port_env.clone(),
            restart_delay: launcher.restart_delay(),
        }
    }
}

/// Point-in-time view of a supervisor, used by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub domain: String,
    pub state: SupervisorState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub spawn_count: u64,
}

struct Inner {
    descriptor: Option<Arc<ServiceDescriptor>>,
    state: SupervisorState,
    pid: Option<u32>,
    generation: u64,
    /// Tells the monitor task of the current child to terminate it
    terminate_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    spawn_count: u64,
}

/// Owns the lifecycle of one domain's backend process.
///
/// Like the registry that creates it, a supervisor lives behind an `Arc`:
/// restarting spawns monitor tasks that need a handle back to it.
pub struct BackendSupervisor {
    domain: String,
    settings: SupervisorSettings,
    inner: Mutex<Inner>,
}

impl BackendSupervisor {
    pub fn new(domain: impl Into<String>, settings: SupervisorSettings) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.into(),
            settings,
            inner: Mutex::new(Inner {
                descriptor: None,
                state: SupervisorState::Idle,
                pid: None,
                generation: 0,
                terminate_tx: None,
                monitor: None,
                spawn_count: 0,
            }),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current launch parameters, replaced atomically on every change
    pub fn descriptor(&self) -> Option<Arc<ServiceDescriptor>> {
        self.inner.lock().descriptor.clone()
    }

    /// Port the backend was told to listen on
    pub fn port(&self) -> Option<u16> {
        self.inner.lock().descriptor.as_ref().map(|d| d.port)
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    /// PID of the live child, if any
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Number of successful spawns over the supervisor's lifetime
    pub fn spawn_count(&self) -> u64 {
        self.inner.lock().spawn_count
    }

    pub fn status(&self) -> SupervisorStatus {
        let inner = self.inner.lock();
        SupervisorStatus {
            domain: self.domain.clone(),
            state: inner.state,
            port: inner.descriptor.as_ref().map(|d| d.port),
            pid: inner.pid,
            spawn_count: inner.spawn_count,
        }
    }

    /// Store new launch parameters and restart the backend.
    ///
    /// Returns `false` without side effects when all four values match the
    /// ones already held.
    pub fn set_parameters(
        self: &Arc<Self>,
        command: &str,
        args: &[String],
        working_dir: &Path,
        port: u16,
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            if let Some(current) = &inner.descriptor {
                if current.launches_same(command, args, working_dir, port) {
                    return false;
                }
            }
            inner.descriptor = Some(Arc::new(ServiceDescriptor {
                domain: self.domain.clone(),
                command: command.to_string(),
                args: args.to_vec(),
                working_dir: working_dir.to_path_buf(),
                port,
            }));
        }

        info!(
            domain = %self.domain,
            command,
            ?args,
            working_dir = %working_dir.display(),
            port,
            "Backend parameters changed"
        );

        // Spawn failures are logged by restart and wait for the next trigger
        let _ = self.restart();
        true
    }

    /// Terminate the current child (without waiting) and spawn a new one
    pub fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.restart_if(None)
    }

    /// Restart, unless `expected_generation` is given and another restart
    /// has happened since. The check and the spawn share one lock.
    fn restart_if(self: &Arc<Self>, expected_generation: Option<u64>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock();

        if let Some(expected) = expected_generation {
            if inner.generation != expected {
                debug!(domain = %self.domain, "Scheduled restart superseded");
                return Ok(());
            }
        }

        let descriptor = inner
            .descriptor
            .clone()
            .ok_or_else(|| SupervisorError::NotConfigured {
                domain: self.domain.clone(),
            })?;

        if let Some(terminate_tx) = inner.terminate_tx.take() {
            debug!(domain = %self.domain, pid = ?inner.pid, "Terminating previous backend process");
            let _ = terminate_tx.send(());
        }
        inner.monitor = None;

        inner.generation += 1;
        let generation = inner.generation;
        inner.state = SupervisorState::Starting;
        inner.pid = None;

        let mut child = match self.spawn_child(&descriptor) {
            Ok(child) => child,
            Err(e) => {
                inner.state = SupervisorState::SpawnFailed;
                error!(
                    domain = %self.domain,
                    command = %descriptor.command,
                    error = %e,
                    "Failed to spawn backend process"
                );
                return Err(SupervisorError::Spawn {
                    domain: self.domain.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        inner.state = SupervisorState::Running;
        inner.pid = pid;
        inner.spawn_count += 1;

        if let Some(stdout) = child.stdout.take() {
            relay_output(self.domain.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(self.domain.clone(), "stderr", stderr);
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        inner.terminate_tx = Some(terminate_tx);
        inner.monitor = Some(tokio::spawn(monitor_child(
            Arc::downgrade(self),
            self.domain.clone(),
            child,
            generation,
            terminate_rx,
        )));
        drop(inner);

        info!(domain = %self.domain, port = descriptor.port, ?pid, "Backend process started");

        Ok(())
    }

    /// Terminate the current child and disable automatic restarts.
    ///
    /// The returned handle completes once the child is gone. A later
    /// parameter change or reload starts the backend again.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.state = SupervisorState::Stopped;
        inner.pid = None;

        let monitor = inner.monitor.take();
        if let Some(terminate_tx) = inner.terminate_tx.take() {
            debug!(domain = %self.domain, "Stopping backend process");
            let _ = terminate_tx.send(());
        }
        monitor
    }

    fn spawn_child(&self, descriptor: &ServiceDescriptor) -> std::io::Result<Child> {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);
        cmd.current_dir(&descriptor.working_dir);
        cmd.env(&self.settings.port_env, descriptor.port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.spawn()
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let (code, signal) = match &status {
            Ok(status) => (status.code(), exit_signal(status)),
            Err(e) => {
                error!(domain = %self.domain, error = %e, "Failed waiting for backend process");
                (None, None)
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(domain = %self.domain, ?code, ?signal, "Superseded backend process exited");
                return;
            }
            inner.state = SupervisorState::Exited { code, signal };
            inner.pid = None;
            inner.terminate_tx = None;
            inner.monitor = None;
        }

        let delay = self.settings.restart_delay;
        warn!(
            domain = %self.domain,
            ?code,
            ?signal,
            delay_ms = delay.as_millis() as u64,
            "Backend process exited, restarting after delay"
        );

        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(supervisor) = supervisor.upgrade() {
                let _ = supervisor.restart_if(Some(generation));
            }
        });
    }
}

enum ChildOutcome {
    Exited(std::io::Result<ExitStatus>),
    Terminate,
}

/// Waits on one child. Holds only a weak handle so a dropped supervisor
/// takes its child down with it.
async fn monitor_child(
    supervisor: Weak<BackendSupervisor>,
    domain: String,
    mut child: Child,
    generation: u64,
    mut terminate_rx: oneshot::Receiver<()>,
) {
    let outcome = tokio::select! {
        status = child.wait() => ChildOutcome::Exited(status),
        _ = &mut terminate_rx => ChildOutcome::Terminate,
    };

    match outcome {
        ChildOutcome::Exited(status) => {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_exit(generation, status);
            }
        }
        ChildOutcome::Terminate => {
            send_terminate(&mut child);
            match tokio::time::timeout(TERMINATE_GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(domain, ?status, "Previous backend process terminated");
                }
                Ok(Err(e)) => {
                    warn!(domain, error = %e, "Error waiting for backend to exit");
                }
                Err(_) => {
                    warn!(
                        domain,
                        grace_period_secs = TERMINATE_GRACE_PERIOD.as_secs(),
                        "Grace period exceeded, killing backend process"
                    );
                    let _ = child.kill().await;
                }
            }
        }
    }
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
    }

    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Relay a child's output line by line, tagged with its domain
fn relay_output<R>(domain: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if stream == "stderr" {
                        warn!(target: "backend", domain = %domain, stream, "[{}] {}", domain, line);
                    } else {
                        info!(target: "backend", domain = %domain, stream, "[{}] {}", domain, line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(domain, stream, error = %e, "Output relay stopped");
                    break;
                }
            }
        }
    });
}
