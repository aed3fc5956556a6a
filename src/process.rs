//! Spawning, watching and stopping the server process.
//!
//! The OS process sits behind the `Launcher` and `ManagedProcess` traits so
//! the orchestrator can be driven by a fake process in tests. Everything
//! above those traits (state tracking, readiness, shutdown escalation) lives
//! in `ServerSupervisor`.

use crate::config::{Readiness, RunConfiguration};
use crate::error::{CleanupWarning, Error, Result};
use crate::readiness::{Backoff, ReadinessProbe};
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a graceful shutdown may take before the process is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Whether a process is still around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
}

/// A spawned process the supervisor owns.
pub trait ManagedProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking exit check. Reaps the process if it has exited.
    fn poll(&mut self) -> io::Result<Liveness>;

    /// Asks the process to shut down.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the process down.
    fn kill(&mut self) -> io::Result<()>;

    /// Blocks until the process has exited and returns its exit code.
    fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Starts processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, binary: &Path, args: &[OsString]) -> io::Result<Box<dyn ManagedProcess>>;
}

/// Launches real OS processes with their output discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, binary: &Path, args: &[OsString]) -> io::Result<Box<dyn ManagedProcess>> {
        // Nobody reads the server's output, so it must not go to a pipe.
        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

pub struct ChildProcess {
    child: Child,
}

impl ManagedProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> io::Result<Liveness> {
        Ok(match self.child.try_wait()? {
            Some(status) => Liveness::Exited(status.code()),
            None => Liveness::Running,
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        send_terminate(&mut self.child)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait()?.code())
    }
}

// SIGTERM is unreliable for mongod on macOS.
#[cfg(target_os = "macos")]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(all(unix, not(target_os = "macos")))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// Builds the `mongod` argument vector.
pub fn server_args(
    data_dir: &Path,
    port: u16,
    log_path: &Path,
    config: &RunConfiguration,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--dbpath".into(),
        data_dir.as_os_str().to_owned(),
        "--port".into(),
        port.to_string().into(),
        "--quiet".into(),
        "--nohttpinterface".into(),
        "--nounixsocket".into(),
        "--smallfiles".into(),
        // durability is pointless for throwaway data
        "--nojournal".into(),
        "--logpath".into(),
        log_path.as_os_str().to_owned(),
        "-vvvvvvvvvvv".into(),
    ];
    if !config.preallocate_storage {
        args.push("--noprealloc".into());
    }
    if !config.enable_scripting {
        args.push("--noscripting".into());
    }
    args.extend(config.extra_args.iter().map(OsString::from));
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Stopping,
    Stopped,
    /// Exited without being asked to.
    Crashed(Option<i32>),
}

/// Owns the server process for the lifetime of a run.
pub struct ServerSupervisor {
    process: Box<dyn ManagedProcess>,
    state: ServerState,
}

impl ServerSupervisor {
    pub fn spawn(launcher: &dyn Launcher, binary: &Path, args: &[OsString]) -> Result<Self> {
        let process = launcher.launch(binary, args).map_err(|source| Error::ProcessStart {
            binary: binary.to_path_buf(),
            source,
        })?;
        debug!(target: "mongod_sandbox::process", pid = process.id(), binary = %binary.display(), "Spawned server");

        Ok(ServerSupervisor {
            process,
            state: ServerState::Starting,
        })
    }

    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Checks whether the process is still running, recording a crash if not.
    pub fn is_alive(&mut self) -> io::Result<bool> {
        match self.state {
            ServerState::Stopped | ServerState::Crashed(_) => return Ok(false),
            _ => {}
        }
        match self.process.poll()? {
            Liveness::Running => Ok(true),
            Liveness::Exited(code) => {
                self.state = ServerState::Crashed(code);
                Ok(false)
            }
        }
    }

    /// Returns once the server is presumed to accept connections.
    pub fn await_ready(
        &mut self,
        host: &str,
        port: u16,
        readiness: Readiness,
        probe: &dyn ReadinessProbe,
    ) -> Result<()> {
        match readiness {
            Readiness::FixedDelay { delay_ms } => {
                std::thread::sleep(Duration::from_millis(delay_ms));
                self.ensure_alive()?;
            }
            Readiness::Probe { timeout_ms, initial_backoff_ms, max_backoff_ms } => {
                let timeout = Duration::from_millis(timeout_ms);
                let mut backoff = Backoff::new(
                    Duration::from_millis(initial_backoff_ms),
                    Duration::from_millis(max_backoff_ms),
                );
                let started = Instant::now();
                let mut attempts = 0u32;
                loop {
                    self.ensure_alive()?;
                    attempts += 1;
                    if probe.is_ready(host, port) {
                        debug!(target: "mongod_sandbox::process", attempts, "Server is accepting connections");
                        break;
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(Error::ReadinessTimeout {
                            endpoint: format!("{host}:{port}"),
                            waited,
                        });
                    }
                    std::thread::sleep(backoff.next_delay().min(timeout - waited));
                }
            }
        }
        self.state = ServerState::Ready;
        Ok(())
    }

    fn ensure_alive(&mut self) -> Result<()> {
        if self.is_alive()? {
            return Ok(());
        }
        let code = match self.state {
            ServerState::Crashed(code) => code,
            _ => None,
        };
        Err(Error::ServerExited { code })
    }

    /// Stops the process and reaps it. Never blocks on a process that is
    /// already gone, and never fails: problems come back as warnings.
    pub fn terminate(&mut self) -> Vec<CleanupWarning> {
        self.terminate_within(SHUTDOWN_GRACE)
    }

    pub fn terminate_within(&mut self, grace: Duration) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        match self.state {
            ServerState::Stopped => return warnings,
            ServerState::Crashed(code) => {
                warnings.push(already_exited(code));
                self.state = ServerState::Stopped;
                return warnings;
            }
            _ => {}
        }

        match self.process.poll() {
            Ok(Liveness::Exited(code)) => {
                warnings.push(already_exited(code));
                self.state = ServerState::Stopped;
                return warnings;
            }
            Ok(Liveness::Running) => {}
            Err(e) => warnings.push(CleanupWarning::Terminate { message: e.to_string() }),
        }

        self.state = ServerState::Stopping;
        if let Err(e) = self.process.terminate() {
            warnings.push(CleanupWarning::Terminate { message: format!("terminate signal: {e}") });
        }

        if !self.exited_within(grace) {
            warn!(target: "mongod_sandbox::process", pid = self.pid(), ?grace, "Server ignored termination, killing it");
            if let Err(e) = self.process.kill() {
                warnings.push(CleanupWarning::Terminate { message: format!("kill: {e}") });
            }
        }

        match self.process.wait() {
            Ok(code) => debug!(target: "mongod_sandbox::process", ?code, "Server exited"),
            Err(e) => warnings.push(CleanupWarning::Terminate { message: format!("wait: {e}") }),
        }
        self.state = ServerState::Stopped;

        for warning in &warnings {
            warn!(target: "mongod_sandbox::process", %warning, "Problem while stopping server");
        }
        warnings
    }

    fn exited_within(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.process.poll() {
                Ok(Liveness::Exited(_)) => return true,
                Ok(Liveness::Running) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

fn already_exited(code: Option<i32>) -> CleanupWarning {
    CleanupWarning::Terminate {
        message: format!("server had already exited (exit code {code:?})"),
    }
}
