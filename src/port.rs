//! Port allocation.
//!
//! The port is found by binding a listener to port 0 and releasing it again
//! before the server binds it. Another process may grab the port in that
//! window; `start` allocates as late as possible to keep the window small.

use crate::error::{Error, Result};
use std::net::TcpListener;
use tracing::debug;

/// Asks the OS for an unused port on `host`.
pub fn allocate(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).map_err(|source| Error::ResourceAllocation {
        host: host.to_string(),
        source,
    })?;
    let port = listener
        .local_addr()
        .map_err(|source| Error::ResourceAllocation { host: host.to_string(), source })?
        .port();
    drop(listener);

    debug!(target: "mongod_sandbox::port", host, port, "Allocated port");
    Ok(port)
}

/// Checks that an explicitly configured port can be bound right now.
pub fn ensure_available(host: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::Configuration("Port 0 cannot be used as an explicit port".to_string()));
    }
    TcpListener::bind((host, port))
        .map(drop)
        .map_err(|e| Error::Configuration(format!("Port {port} on {host} is not usable: {e}")))
}
