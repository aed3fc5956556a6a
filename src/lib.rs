//! Throwaway `mongod` servers for test runs.
//!
//! A run starts one `mongod` on a free port with a private temporary data
//! directory and a randomly named logical database, optionally clears that
//! database whenever a module or class of tests finishes, and tears
//! everything down again at the end, including after a failed start.
//!
//! ```no_run
//! use mongod_sandbox::{RunConfiguration, ScopeKind};
//!
//! let config = RunConfiguration::enabled().with_clear_after(ScopeKind::Class, true);
//! let mut run = mongod_sandbox::start(&config)?;
//! let info = run.connection_info().expect("enabled runs are active");
//! println!("connect to {}", info.uri());
//!
//! run.on_scope_boundary(ScopeKind::Class)?;
//! run.stop()?;
//! # Ok::<(), mongod_sandbox::Error>(())
//! ```

pub mod binary;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod naming;
pub mod port;
pub mod process;
pub mod publish;
pub mod readiness;
pub mod run;

pub use cleaner::{CleanupReport, CollectionStore, MongoConnector, ScopeCleaner, StoreConnector};
pub use config::{Readiness, RunConfiguration, ScopeKind};
pub use error::{CleanupWarning, Error, Result, StoreError};
pub use process::{Launcher, Liveness, ManagedProcess, ServerState, SystemLauncher};
pub use publish::{ConnectionInfo, EnvPublisher};
pub use readiness::{ReadinessProbe, TcpProbe};
pub use run::{Orchestrator, RunHandle, StopReport};

/// Starts a run with the real process launcher and MongoDB driver.
pub fn start(config: &RunConfiguration) -> Result<RunHandle> {
    Orchestrator::default().start(config)
}
