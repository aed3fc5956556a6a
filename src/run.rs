//! The lifecycle of one sandbox run: `start`, scope boundaries, `stop`.

use crate::binary;
use crate::cleaner::{CleanupReport, MongoConnector, ScopeCleaner, StoreConnector};
use crate::config::{RunConfiguration, ScopeKind};
use crate::error::{CleanupWarning, Error, Result};
use crate::naming;
use crate::port;
use crate::process::{server_args, Launcher, ServerSupervisor, SystemLauncher};
use crate::publish::{ConnectionInfo, EnvPublisher};
use crate::readiness::{ReadinessProbe, TcpProbe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Starts runs. Holds the collaborators that touch the outside world.
#[derive(Clone)]
pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
    connector: Arc<dyn StoreConnector>,
    probe: Arc<dyn ReadinessProbe>,
    search_dirs: Option<Vec<PathBuf>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Orchestrator {
            launcher: Arc::new(SystemLauncher),
            connector: Arc::new(MongoConnector::default()),
            probe: Arc::new(TcpProbe::default()),
            search_dirs: None,
        }
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Searches these directories for the binary instead of `PATH`.
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = Some(dirs);
        self
    }

    /// Starts a server for `config`.
    ///
    /// When `config.enable` is false this returns an inactive handle and
    /// touches nothing. If anything fails after the data directory was
    /// created, the process (if any) is stopped and the directory removed
    /// before the error is returned.
    pub fn start(&self, config: &RunConfiguration) -> Result<RunHandle> {
        if !config.enable {
            debug!(target: "mongod_sandbox::run", "Sandbox disabled, not starting a server");
            return Ok(RunHandle::inactive());
        }

        let binary = match &self.search_dirs {
            Some(dirs) => binary::resolve_in(config.binary_path.as_deref(), dirs.iter().cloned())?,
            None => binary::resolve(config.binary_path.as_deref())?,
        };
        let log_path = config.prepare_log_path()?;
        if config.port != 0 {
            port::ensure_available(&config.host, config.port)?;
        }

        let data_dir = tempfile::Builder::new().prefix("mongod-sandbox-").tempdir()?;
        debug!(target: "mongod_sandbox::run", path = %data_dir.path().display(), "Created data directory");

        let (supervisor, port) = match self.launch(config, &binary, &log_path, data_dir.path()) {
            Ok(launched) => launched,
            Err(e) => {
                discard_data_dir(data_dir);
                return Err(e);
            }
        };

        let info = ConnectionInfo {
            host: config.host.clone(),
            port,
            database: naming::generate(),
        };
        let publisher = EnvPublisher::from_config(config);
        if let Some(publisher) = &publisher {
            publisher.publish(&info);
        }

        info!(
            target: "mongod_sandbox::run",
            endpoint = %info.endpoint(),
            database = %info.database,
            pid = supervisor.pid(),
            "Sandbox server ready"
        );

        Ok(RunHandle {
            active: Some(ActiveRun {
                info,
                supervisor,
                data_dir,
                cleaner: ScopeCleaner::new(config, self.connector.clone()),
            }),
            publisher,
        })
    }

    fn launch(
        &self,
        config: &RunConfiguration,
        binary: &Path,
        log_path: &Path,
        data_dir: &Path,
    ) -> Result<(ServerSupervisor, u16)> {
        let port = match config.port {
            0 => port::allocate(&config.host)?,
            explicit => explicit,
        };
        let args = server_args(data_dir, port, log_path, config);
        debug!(target: "mongod_sandbox::run", ?args, "Launching server");

        let mut supervisor = ServerSupervisor::spawn(self.launcher.as_ref(), binary, &args)?;
        if let Err(e) =
            supervisor.await_ready(&config.host, port, config.readiness, self.probe.as_ref())
        {
            warn!(target: "mongod_sandbox::run", error = %e, "Server did not come up, shutting it down");
            supervisor.terminate();
            return Err(e);
        }
        Ok((supervisor, port))
    }
}

fn discard_data_dir(data_dir: TempDir) {
    let path = data_dir.path().to_path_buf();
    if let Err(e) = data_dir.close() {
        warn!(target: "mongod_sandbox::run", path = %path.display(), error = %e, "Could not remove data directory");
    }
}

struct ActiveRun {
    info: ConnectionInfo,
    supervisor: ServerSupervisor,
    data_dir: TempDir,
    cleaner: ScopeCleaner,
}

/// What `stop` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// False when there was nothing to stop.
    pub stopped: bool,
    pub warnings: Vec<CleanupWarning>,
}

/// A started (or disabled) run.
///
/// Dropping a running handle stops it.
pub struct RunHandle {
    active: Option<ActiveRun>,
    publisher: Option<EnvPublisher>,
}

impl RunHandle {
    /// A handle for a run that was never started.
    pub fn inactive() -> Self {
        RunHandle { active: None, publisher: None }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// `None` before start and after `stop`.
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.active.as_ref().map(|run| &run.info)
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.active.as_ref().map(|run| run.data_dir.path())
    }

    pub fn pid(&self) -> Option<u32> {
        self.active.as_ref().map(|run| run.supervisor.pid())
    }

    /// Polls the server process. False if it crashed or the run is over.
    pub fn is_server_alive(&mut self) -> bool {
        match self.active.as_mut() {
            Some(run) => run.supervisor.is_alive().unwrap_or(false),
            None => false,
        }
    }

    /// Clears the run's database if configured for `scope`.
    pub fn on_scope_boundary(&self, scope: ScopeKind) -> Result<CleanupReport> {
        let Some(run) = &self.active else {
            return Ok(CleanupReport::default());
        };
        run.cleaner.on_boundary(scope, &run.info.database, &run.info.host, run.info.port)
    }

    /// Stops the server and removes its data directory.
    ///
    /// Calling this on a stopped or inactive handle does nothing. Problems
    /// stopping the process are collected as warnings; failing to remove the
    /// data directory is an error. Either way the handle is stopped afterwards.
    pub fn stop(&mut self) -> Result<StopReport> {
        let Some(run) = self.active.take() else {
            return Ok(StopReport::default());
        };
        if let Some(publisher) = &self.publisher {
            publisher.retract();
        }

        let ActiveRun { info, mut supervisor, data_dir, .. } = run;
        let warnings = supervisor.terminate();

        let path = data_dir.path().to_path_buf();
        if let Err(source) = data_dir.close() {
            return Err(Error::DataDirectory { path, source, warnings });
        }

        info!(target: "mongod_sandbox::run", endpoint = %info.endpoint(), warnings = warnings.len(), "Sandbox server stopped");
        Ok(StopReport { stopped: true, warnings })
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(target: "mongod_sandbox::run", error = %e, "Cleanup on drop failed");
        }
    }
}
