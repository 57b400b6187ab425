//! Management Session Proxy Interface
//!
//! The forwarder never talks to the management server itself. Every accepted
//! local connection asks a [`ProxySession`] to open a TCP connection on the far
//! side of an already-authenticated session, and gets back a byte stream
//! multiplexed over that session's transport.
//!
//! # Usage
//!
//! ```ignore
//! let channel = session.open_proxy_channel(&ProxyTarget::new(1042, 5900)).await?;
//! ```

mod error;

pub use error::ProxyError;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// Full-duplex byte stream to the remote target.
///
/// Anything tokio can read from and write to qualifies: a real tunneled
/// channel, a `TcpStream`, or an in-memory `tokio::io::duplex` pair.
/// Closing the channel means shutting it down and dropping it.
pub trait DuplexChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased proxy channel
pub type BoxedChannel = Box<dyn DuplexChannel>;

/// Destination of a forward, resolved on the far side of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTarget {
    /// Object id of the node the agent connection belongs to
    pub node_id: u32,
    /// TCP port to connect to on the remote side
    pub remote_port: u16,
    /// Connect to the agent's own loopback address instead of the node's
    /// primary address (services bound to localhost, e.g. a local VNC server)
    #[serde(default)]
    pub via_agent_loopback: bool,
}

impl ProxyTarget {
    /// Create a target for `remote_port` on the node's primary address
    pub fn new(node_id: u32, remote_port: u16) -> Self {
        Self {
            node_id,
            remote_port,
            via_agent_loopback: false,
        }
    }

    /// Route the connection to the agent's loopback address
    pub fn via_agent_loopback(mut self) -> Self {
        self.via_agent_loopback = true;
        self
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.via_agent_loopback {
            write!(f, "node {} (agent loopback):{}", self.node_id, self.remote_port)
        } else {
            write!(f, "node {}:{}", self.node_id, self.remote_port)
        }
    }
}

/// Authenticated management session able to open proxy channels.
///
/// Implementations must be cheap to share: the forwarder keeps one
/// `Arc<dyn ProxySession>` and calls it from its accept task.
#[async_trait]
pub trait ProxySession: Send + Sync + 'static {
    /// Open a TCP connection to `target` on the far side of the session.
    ///
    /// A failure must leave nothing half-open behind.
    async fn open_proxy_channel(&self, target: &ProxyTarget) -> Result<BoxedChannel, ProxyError>;

    /// Human-readable node name, only used in status messages
    fn resolve_display_name(&self, node_id: u32) -> String {
        format!("[{}]", node_id)
    }
}
