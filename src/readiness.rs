//! Deciding when a freshly spawned server accepts connections.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A cheap check that the server is reachable.
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// Considers the server ready once a TCP connection to its port succeeds.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        TcpProbe { connect_timeout: Duration::from_millis(250) }
    }
}

impl ReadinessProbe for TcpProbe {
    fn is_ready(&self, host: &str, port: u16) -> bool {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(_) => return false,
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.connect_timeout).is_ok())
    }
}

/// Exponential backoff between probe attempts, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Backoff { next: initial.max(Duration::from_millis(1)), max: max.max(initial) }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}
