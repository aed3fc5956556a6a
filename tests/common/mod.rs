// Test doubles shared by the integration tests
#![allow(dead_code)]

use mongod_sandbox::binary::SERVER_BINARY;
use mongod_sandbox::{
    CollectionStore, Launcher, Liveness, ManagedProcess, Readiness, ReadinessProbe,
    RunConfiguration, StoreConnector, StoreError,
};
use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

/// What the fake server has been through.
#[derive(Debug, Default)]
pub struct ServerLog {
    pub launches: Vec<Vec<String>>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub terminates: usize,
    pub kills: usize,
    pub waits: usize,
    pub fail_launch: bool,
    /// Exit right after launch with this code.
    pub crash_on_launch: Option<i32>,
}

/// Launcher producing in-memory processes that share one `ServerLog`.
#[derive(Default)]
pub struct FakeServer {
    log: Arc<Mutex<ServerLog>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeServer::default())
    }

    pub fn log(&self) -> MutexGuard<'_, ServerLog> {
        self.log.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.log().running
    }

    pub fn crash(&self, code: i32) {
        let mut log = self.log();
        log.running = false;
        log.exit_code = Some(code);
    }

    /// The `--dbpath` argument of the last launch.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.arg_after("--dbpath").map(PathBuf::from)
    }

    pub fn arg_after(&self, flag: &str) -> Option<String> {
        let log = self.log();
        let args = log.launches.last()?;
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).cloned()
    }
}

impl Launcher for FakeServer {
    fn launch(&self, _binary: &Path, args: &[OsString]) -> io::Result<Box<dyn ManagedProcess>> {
        let mut log = self.log();
        log.launches.push(args.iter().map(|a| a.to_string_lossy().into_owned()).collect());
        if log.fail_launch {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "exec format error"));
        }
        match log.crash_on_launch {
            Some(code) => log.exit_code = Some(code),
            None => log.running = true,
        }
        Ok(Box::new(FakeProcess { log: self.log.clone() }))
    }
}

struct FakeProcess {
    log: Arc<Mutex<ServerLog>>,
}

impl ManagedProcess for FakeProcess {
    fn id(&self) -> u32 {
        31337
    }

    fn poll(&mut self) -> io::Result<Liveness> {
        let log = self.log.lock().unwrap();
        Ok(if log.running { Liveness::Running } else { Liveness::Exited(log.exit_code) })
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.terminates += 1;
        log.running = false;
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.kills += 1;
        log.running = false;
        Ok(())
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        let mut log = self.log.lock().unwrap();
        log.waits += 1;
        Ok(log.exit_code)
    }
}

/// Probe with a fixed answer.
pub struct FixedProbe(pub bool);

impl ReadinessProbe for FixedProbe {
    fn is_ready(&self, _host: &str, _port: u16) -> bool {
        self.0
    }
}

/// In-memory database standing in for the MongoDB driver.
#[derive(Default)]
pub struct FakeConnector {
    pub collections: Mutex<Vec<String>>,
    pub protected: Mutex<HashSet<String>>,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub dropped: Arc<Mutex<Vec<String>>>,
    pub last_target: Mutex<Option<(String, u16, String)>>,
}

impl FakeConnector {
    pub fn with_collections(names: &[&str]) -> Arc<Self> {
        let connector = FakeConnector::default();
        *connector.collections.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
        Arc::new(connector)
    }

    pub fn protect(&self, name: &str) {
        self.protected.lock().unwrap().insert(name.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl StoreConnector for FakeConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        database: &str,
    ) -> Result<Box<dyn CollectionStore>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_target.lock().unwrap() = Some((host.to_string(), port, database.to_string()));
        Ok(Box::new(FakeStore {
            collections: self.collections.lock().unwrap().clone(),
            protected: self.protected.lock().unwrap().clone(),
            dropped: self.dropped.clone(),
            closes: self.closes.clone(),
        }))
    }
}

struct FakeStore {
    collections: Vec<String>,
    protected: HashSet<String>,
    dropped: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl CollectionStore for FakeStore {
    fn list_collections(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self.collections.clone())
    }

    fn drop_collection(&mut self, name: &str) -> Result<(), StoreError> {
        self.dropped.lock().unwrap().push(name.to_string());
        if self.protected.contains(name) {
            return Err(StoreError::new(format!("can't drop {name}: not authorized")));
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Directory holding an executable file named like the server binary.
pub fn fake_binary_dir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(SERVER_BINARY);
    std::fs::write(&path, "#!/bin/sh\nexec sleep 60\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (dir, path)
}

/// An enabled configuration with its own environment keys.
pub fn test_config(binary: &Path, test_name: &str) -> RunConfiguration {
    let prefix = format!("MONGOD_SANDBOX_{}", test_name.to_uppercase());
    RunConfiguration::enabled()
        .with_binary_path(binary)
        .with_readiness(Readiness::Probe {
            timeout_ms: 200,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        })
        .with_env_vars(format!("{prefix}_ENDPOINT"), format!("{prefix}_DATABASE"))
}

pub fn short_probe_timeout() -> Readiness {
    Readiness::probe(Duration::from_millis(50))
}
