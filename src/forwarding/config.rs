//! Forwarder configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::relay::DEFAULT_BUFFER_SIZE;

/// Idle timeout used when forwarding for a browser-opened URL
pub const BROWSER_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Local listener and relay settings for one port forwarder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForwarderConfig {
    /// Address the local listener binds to
    pub bind_address: IpAddr,
    /// Local port, 0 for an ephemeral port
    pub local_port: u16,
    /// Stop accepting after this long without a new connection.
    /// `None` or 0 waits forever.
    pub idle_timeout_ms: Option<u64>,
    /// Per-direction relay buffer size
    pub buffer_size: usize,
    /// Disable Nagle's algorithm on accepted sockets
    pub nodelay: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            idle_timeout_ms: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
        }
    }
}

impl ForwarderConfig {
    /// Preset for URLs opened in an external browser: the listener goes
    /// away after ten minutes without new connections.
    pub fn browser() -> Self {
        Self::default().with_idle_timeout(BROWSER_IDLE_TIMEOUT)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        // Round up: a stored 0 means no timeout
        let ms = timeout.as_nanos().div_ceil(1_000_000);
        self.idle_timeout_ms = Some(u64::try_from(ms).unwrap_or(u64::MAX));
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.local_port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Buffer size, never zero
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }
}
