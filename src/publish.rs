//! Connection coordinates handed to test code.

use crate::config::RunConfiguration;
use std::fmt;

/// Where a run's server listens and which database it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl ConnectionInfo {
    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint(), self.database)
    }
}

/// Mirrors a run's coordinates into process environment variables.
///
/// The environment is one slot per key for the whole process. Runs that may
/// overlap need distinct keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPublisher {
    pub endpoint_var: String,
    pub database_var: String,
}

impl EnvPublisher {
    pub fn from_config(config: &RunConfiguration) -> Option<Self> {
        config.publish_env.then(|| EnvPublisher {
            endpoint_var: config.endpoint_var.clone(),
            database_var: config.database_var.clone(),
        })
    }

    pub fn publish(&self, info: &ConnectionInfo) {
        std::env::set_var(&self.endpoint_var, info.endpoint());
        std::env::set_var(&self.database_var, &info.database);
    }

    pub fn retract(&self) {
        std::env::remove_var(&self.endpoint_var);
        std::env::remove_var(&self.database_var);
    }
}
