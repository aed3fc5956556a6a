//! Dropping a run's collections at scope boundaries.
//!
//! The cleaner opens its own short-lived connection every time, so it never
//! interferes with the connections held by test code.

use crate::config::{RunConfiguration, ScopeKind};
use crate::error::{CleanupWarning, Result, StoreError};
use mongodb::bson::Document;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, trace, warn};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// A connection to one logical database.
pub trait CollectionStore {
    fn list_collections(&mut self) -> StoreResult<Vec<String>>;
    fn drop_collection(&mut self, name: &str) -> StoreResult<()>;
    /// Releases the connection.
    fn close(self: Box<Self>);
}

/// Opens `CollectionStore`s.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16, database: &str) -> StoreResult<Box<dyn CollectionStore>>;
}

/// Collections the server owns; dropping them is expected to be refused.
pub fn is_system_collection(name: &str) -> bool {
    name.starts_with("system.")
}

/// What a boundary cleanup did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// False when cleanup is disabled for the scope.
    pub performed: bool,
    pub dropped: Vec<String>,
    /// System collections the server refused to drop.
    pub kept: Vec<String>,
    pub warnings: Vec<CleanupWarning>,
}

pub struct ScopeCleaner {
    clear_after_module: bool,
    clear_after_class: bool,
    connector: Arc<dyn StoreConnector>,
}

impl ScopeCleaner {
    pub fn new(config: &RunConfiguration, connector: Arc<dyn StoreConnector>) -> Self {
        ScopeCleaner {
            clear_after_module: config.clears_after(ScopeKind::Module),
            clear_after_class: config.clears_after(ScopeKind::Class),
            connector,
        }
    }

    pub fn is_enabled(&self, scope: ScopeKind) -> bool {
        match scope {
            ScopeKind::Module => self.clear_after_module,
            ScopeKind::Class => self.clear_after_class,
        }
    }

    pub fn on_boundary(
        &self,
        scope: ScopeKind,
        database: &str,
        host: &str,
        port: u16,
    ) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if !self.is_enabled(scope) {
            return Ok(report);
        }
        report.performed = true;

        let mut store = self.connector.connect(host, port, database)?;
        let result = drop_all(store.as_mut(), &mut report);
        store.close();
        result?;

        debug!(
            target: "mongod_sandbox::cleaner",
            ?scope,
            database,
            dropped = report.dropped.len(),
            "Cleared database"
        );
        Ok(report)
    }
}

fn drop_all(store: &mut dyn CollectionStore, report: &mut CleanupReport) -> StoreResult<()> {
    for name in store.list_collections()? {
        match store.drop_collection(&name) {
            Ok(()) => report.dropped.push(name),
            Err(e) if is_system_collection(&name) => {
                trace!(target: "mongod_sandbox::cleaner", collection = %name, error = %e, "System collection kept");
                report.kept.push(name);
            }
            Err(e) => {
                let warning = CleanupWarning::DropFailed { collection: name, message: e.message };
                warn!(target: "mongod_sandbox::cleaner", %warning, "Collection not dropped");
                report.warnings.push(warning);
            }
        }
    }
    Ok(())
}

/// Connects with the official MongoDB driver.
///
/// Each store drives the async driver on a private runtime. When the caller
/// is itself inside a Tokio runtime, driver calls are made from a helper
/// thread instead of blocking the caller's worker.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    pub server_selection_timeout: Duration,
}

impl Default for MongoConnector {
    fn default() -> Self {
        MongoConnector { server_selection_timeout: Duration::from_secs(5) }
    }
}

impl StoreConnector for MongoConnector {
    fn connect(&self, host: &str, port: u16, database: &str) -> StoreResult<Box<dyn CollectionStore>> {
        let runtime = DriverRuntime::new()?;

        let uri = format!(
            "mongodb://{host}:{port}/?directConnection=true&serverSelectionTimeoutMS={}",
            self.server_selection_timeout.as_millis()
        );
        let client = runtime.block_on(async {
            let mut options = ClientOptions::parse(&uri).await?;
            options.app_name = Some("mongod-sandbox cleaner".to_string());
            Client::with_options(options)
        })??;
        let database = client.database(database);

        Ok(Box::new(MongoStore { client, database, runtime }))
    }
}

/// Current-thread runtime that is safe to use and drop from async code.
struct DriverRuntime(Option<Runtime>);

impl DriverRuntime {
    fn new() -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::new(format!("failed to create Tokio runtime: {e}")))?;
        Ok(DriverRuntime(Some(runtime)))
    }

    fn block_on<F>(&self, future: F) -> StoreResult<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let runtime = self
            .0
            .as_ref()
            .ok_or_else(|| StoreError::new("driver runtime already shut down"))?;

        // block_on panics on a thread that is already driving a runtime
        if Handle::try_current().is_err() {
            return Ok(runtime.block_on(future));
        }
        Ok(std::thread::scope(|scope| {
            match scope.spawn(|| runtime.block_on(future)).join() {
                Ok(output) => output,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }))
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

struct MongoStore {
    client: Client,
    database: Database,
    // Declared last so the client is dropped while its runtime still exists.
    runtime: DriverRuntime,
}

impl CollectionStore for MongoStore {
    fn list_collections(&mut self) -> StoreResult<Vec<String>> {
        let database = &self.database;
        Ok(self.runtime.block_on(async { database.list_collection_names().await })??)
    }

    fn drop_collection(&mut self, name: &str) -> StoreResult<()> {
        let collection = self.database.collection::<Document>(name);
        Ok(self.runtime.block_on(async { collection.drop().await })??)
    }

    fn close(self: Box<Self>) {
        let MongoStore { client, database, runtime } = *self;
        drop(database);
        if let Err(e) = runtime.block_on(async move { client.shutdown().await }) {
            debug!(target: "mongod_sandbox::cleaner", error = %e, "Client shutdown skipped");
        }
    }
}
