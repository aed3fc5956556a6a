//! Run configuration.
//!
//! A `RunConfiguration` is built once, either in code through the `with_*`
//! methods or from JSON, and is not modified after `start`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENDPOINT_VAR: &str = "TEST_MONGODB";
pub const DEFAULT_DATABASE_VAR: &str = "TEST_MONGODB_DATABASE";

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Which group of tests just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Module,
    Class,
}

/// How `start` decides the server is ready for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Connect to the port until it answers, backing off between attempts.
    Probe {
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_initial_backoff_ms")]
        initial_backoff_ms: u64,
        #[serde(default = "default_max_backoff_ms")]
        max_backoff_ms: u64,
    },
    /// Sleep for a fixed time and assume the server is up.
    FixedDelay { delay_ms: u64 },
}

fn default_probe_timeout_ms() -> u64 {
    30_000
}

fn default_initial_backoff_ms() -> u64 {
    25
}

fn default_max_backoff_ms() -> u64 {
    500
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Probe {
            timeout_ms: default_probe_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Readiness {
    pub fn probe(timeout: Duration) -> Self {
        Readiness::Probe {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn fixed_delay(delay: Duration) -> Self {
        Readiness::FixedDelay { delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfiguration {
    pub enable: bool,
    pub binary_path: Option<PathBuf>,
    pub host: String,
    /// 0 means "allocate one".
    pub port: u16,
    pub clear_after_module: bool,
    pub clear_after_class: bool,
    pub log_path: Option<PathBuf>,
    pub preallocate_storage: bool,
    pub enable_scripting: bool,
    pub readiness: Readiness,
    pub publish_env: bool,
    pub endpoint_var: String,
    pub database_var: String,
    pub extra_args: Vec<String>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        RunConfiguration {
            enable: false,
            binary_path: None,
            host: DEFAULT_HOST.to_string(),
            port: 0,
            clear_after_module: false,
            clear_after_class: false,
            log_path: None,
            preallocate_storage: false,
            enable_scripting: false,
            readiness: Readiness::default(),
            publish_env: true,
            endpoint_var: DEFAULT_ENDPOINT_VAR.to_string(),
            database_var: DEFAULT_DATABASE_VAR.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl RunConfiguration {
    /// Default configuration with the master switch turned on.
    pub fn enabled() -> Self {
        RunConfiguration { enable: true, ..Default::default() }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid configuration: {e}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read configuration {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_clear_after(mut self, scope: ScopeKind, clear: bool) -> Self {
        match scope {
            ScopeKind::Module => self.clear_after_module = clear,
            ScopeKind::Class => self.clear_after_class = clear,
        }
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_preallocate_storage(mut self, preallocate: bool) -> Self {
        self.preallocate_storage = preallocate;
        self
    }

    pub fn with_scripting(mut self, enable: bool) -> Self {
        self.enable_scripting = enable;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_publish_env(mut self, publish: bool) -> Self {
        self.publish_env = publish;
        self
    }

    /// Use different environment keys, e.g. for a second concurrent run.
    pub fn with_env_vars(mut self, endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        self.endpoint_var = endpoint.into();
        self.database_var = database.into();
        self
    }

    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn clears_after(&self, scope: ScopeKind) -> bool {
        match scope {
            ScopeKind::Module => self.clear_after_module,
            ScopeKind::Class => self.clear_after_class,
        }
    }

    /// Expands the log path and makes sure the server will be able to write it.
    ///
    /// The file is created (or truncated) as a side effect.
    pub fn prepare_log_path(&self) -> Result<PathBuf> {
        let path = match &self.log_path {
            Some(path) => expand_path(path),
            None => PathBuf::from(NULL_DEVICE),
        };
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Configuration(format!("Invalid log path {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Expands a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unknown variables are left untouched.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let with_vars = expand_vars(&raw);

    if with_vars == "~" || with_vars.starts_with("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            let rest = with_vars[1..].trim_start_matches('/');
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(with_vars)
}

fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = RunConfiguration::default();
        assert!(!config.enable);
        assert_eq!(config.port, 0);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.endpoint_var, "TEST_MONGODB");
        assert_eq!(config.database_var, "TEST_MONGODB_DATABASE");
        assert!(config.publish_env);
        assert!(matches!(config.readiness, Readiness::Probe { .. }));
    }

    #[test]
    fn test_from_json() {
        let config = RunConfiguration::from_json_str(
            r#"{
                "enable": true,
                "port": 27999,
                "clear_after_class": true,
                "readiness": {"mode": "fixed_delay", "delay_ms": 300}
            }"#,
        )
        .unwrap();
        assert!(config.enable);
        assert_eq!(config.port, 27999);
        assert!(config.clears_after(ScopeKind::Class));
        assert!(!config.clears_after(ScopeKind::Module));
        assert_eq!(config.readiness, Readiness::FixedDelay { delay_ms: 300 });
    }

    #[test]
    fn test_from_json_probe_fills_defaults() {
        let config =
            RunConfiguration::from_json_str(r#"{"readiness": {"mode": "probe", "timeout_ms": 5}}"#)
                .unwrap();
        assert_eq!(
            config.readiness,
            Readiness::Probe { timeout_ms: 5, initial_backoff_ms: 25, max_backoff_ms: 500 }
        );
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        let err = RunConfiguration::from_json_str(r#"{"enabel": true}"#).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_from_json_rejects_out_of_range_port() {
        let err = RunConfiguration::from_json_str(r#"{"port": 70000}"#).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_builder() {
        let config = RunConfiguration::enabled()
            .with_port(4000)
            .with_clear_after(ScopeKind::Module, true)
            .with_scripting(true)
            .with_env_vars("A", "B")
            .with_extra_arg("--bind_ip")
            .with_extra_arg("127.0.0.1");
        assert!(config.enable);
        assert_eq!(config.port, 4000);
        assert!(config.clear_after_module);
        assert!(config.enable_scripting);
        assert_eq!(config.endpoint_var, "A");
        assert_eq!(config.extra_args, vec!["--bind_ip", "127.0.0.1"]);
    }

    #[test]
    fn test_readiness_durations_saturate() {
        assert_eq!(
            Readiness::fixed_delay(Duration::MAX),
            Readiness::FixedDelay { delay_ms: u64::MAX }
        );
        match Readiness::probe(Duration::MAX) {
            Readiness::Probe { timeout_ms, .. } => assert_eq!(timeout_ms, u64::MAX),
            other => panic!("unexpected readiness: {other:?}"),
        }
        assert_eq!(
            Readiness::probe(Duration::from_millis(1500)),
            Readiness::Probe { timeout_ms: 1500, initial_backoff_ms: 25, max_backoff_ms: 500 }
        );
    }

    #[test]
    fn test_prepare_log_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("mongod.log");
        std::fs::write(&log, "stale").unwrap();

        let config = RunConfiguration::enabled().with_log_path(&log);
        assert_eq!(config.prepare_log_path().unwrap(), log);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
    }

    #[test]
    fn test_prepare_log_path_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            RunConfiguration::enabled().with_log_path(dir.path().join("missing/mongod.log"));
        let err = config.prepare_log_path().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Invalid log path"));
    }

    #[test]
    fn test_prepare_log_path_default_is_null_device() {
        let path = RunConfiguration::enabled().prepare_log_path().unwrap();
        assert_eq!(path, PathBuf::from(NULL_DEVICE));
    }

    #[test]
    fn test_expand_vars() {
        std::env::set_var("MONGOD_SANDBOX_TEST_DIR", "/opt/mongo");
        assert_eq!(expand_vars("$MONGOD_SANDBOX_TEST_DIR/bin"), "/opt/mongo/bin");
        assert_eq!(expand_vars("${MONGOD_SANDBOX_TEST_DIR}bin"), "/opt/mongobin");
        assert_eq!(expand_vars("$MONGOD_SANDBOX_UNSET_VAR/x"), "$MONGOD_SANDBOX_UNSET_VAR/x");
        assert_eq!(expand_vars("${unterminated"), "${unterminated");
        assert_eq!(expand_vars("cost$"), "cost$");
    }

    #[test]
    fn test_expand_home() {
        let Some(dirs) = directories::BaseDirs::new() else {
            return;
        };
        assert_eq!(expand_path(Path::new("~/bin/mongod")), dirs.home_dir().join("bin/mongod"));
        assert_eq!(expand_path(Path::new("/usr/bin/mongod")), PathBuf::from("/usr/bin/mongod"));
    }

    proptest! {
        #[test]
        fn prop_paths_without_specials_are_unchanged(s in "[a-zA-Z0-9_./-]{0,40}") {
            prop_assert_eq!(expand_path(Path::new(&s)), PathBuf::from(&s));
        }
    }
}
