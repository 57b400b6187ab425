//! Forward Event System
//!
//! Status reporting for a port forwarder. Every notable transition is
//! described by a [`ForwardEvent`], rendered to a severity and a
//! human-readable line and handed to the registered status sink. This is the
//! only integration point with a presentation layer.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::stats::ForwardStats;

/// Status message severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

/// Callback receiving status lines. Called from background tasks, so it
/// must return quickly.
pub type StatusSink = Arc<dyn Fn(Severity, &str) + Send + Sync>;

/// Why the accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AcceptExit {
    /// Listener closed by `close()`
    Closed,
    /// No connection arrived within the idle timeout
    IdleTimeout,
    /// Unrecoverable accept error
    Failed,
}

/// Forward events reported to the status sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ForwardEvent {
    /// Listener bound and accept loop running
    Listening {
        forward_id: String,
        local_addr: SocketAddr,
        target: String,
    },
    /// Local connection accepted and its proxy channel established
    ConnectionAccepted {
        forward_id: String,
        session_id: u64,
        peer_addr: SocketAddr,
        target: String,
    },
    /// Local connection dropped because the proxy channel could not be opened
    ChannelSetupFailed {
        forward_id: String,
        peer_addr: SocketAddr,
        local_port: u16,
        target: String,
        error: String,
    },
    /// Session ended on end-of-stream or close
    SessionClosed {
        forward_id: String,
        session_id: u64,
        bytes_sent: u64,
        bytes_received: u64,
    },
    /// Session torn down after an I/O failure
    RelayFailed {
        forward_id: String,
        session_id: u64,
        local_port: u16,
        target: String,
        error: String,
    },
    /// Accept loop terminated; no further connections are accepted
    AcceptLoopExited {
        forward_id: String,
        local_port: u16,
        reason: AcceptExit,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Forwarder fully shut down
    Closed {
        forward_id: String,
        stats: ForwardStats,
    },
}

impl ForwardEvent {
    pub fn severity(&self) -> Severity {
        match self {
            ForwardEvent::ChannelSetupFailed { .. } | ForwardEvent::RelayFailed { .. } => {
                Severity::Error
            }
            ForwardEvent::AcceptLoopExited {
                reason: AcceptExit::Failed,
                ..
            } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Human-readable status line
    pub fn message(&self) -> String {
        match self {
            ForwardEvent::Listening {
                forward_id,
                local_addr,
                target,
            } => format!("[{}] Forwarding {} to {}", forward_id, local_addr, target),
            ForwardEvent::ConnectionAccepted {
                forward_id,
                session_id,
                peer_addr,
                target,
            } => format!(
                "[{}] Connection #{} from {} forwarded to {}",
                forward_id, session_id, peer_addr, target
            ),
            ForwardEvent::ChannelSetupFailed {
                forward_id,
                peer_addr,
                local_port,
                target,
                error,
            } => format!(
                "[{}] Cannot setup TCP port forwarding from local port {} to {} (connection from {} dropped): {}",
                forward_id, local_port, target, peer_addr, error
            ),
            ForwardEvent::SessionClosed {
                forward_id,
                session_id,
                bytes_sent,
                bytes_received,
            } => format!(
                "[{}] Connection #{} closed ({} bytes sent, {} bytes received)",
                forward_id, session_id, bytes_sent, bytes_received
            ),
            ForwardEvent::RelayFailed {
                forward_id,
                session_id,
                local_port,
                target,
                error,
            } => format!(
                "[{}] Connection #{} on local port {} to {} failed: {}",
                forward_id, session_id, local_port, target, error
            ),
            ForwardEvent::AcceptLoopExited {
                forward_id,
                local_port,
                reason,
                error,
            } => match (reason, error) {
                (AcceptExit::Closed, _) => {
                    format!("[{}] Listener on local port {} closed", forward_id, local_port)
                }
                (AcceptExit::IdleTimeout, _) => format!(
                    "[{}] No connections on local port {} within idle timeout, listener closed",
                    forward_id, local_port
                ),
                (AcceptExit::Failed, Some(e)) => format!(
                    "[{}] Listener on local port {} failed: {}",
                    forward_id, local_port, e
                ),
                (AcceptExit::Failed, None) => {
                    format!("[{}] Listener on local port {} failed", forward_id, local_port)
                }
            },
            ForwardEvent::Closed { forward_id, stats } => format!(
                "[{}] Port forwarding stopped ({} connections, {} failed)",
                forward_id, stats.connection_count, stats.failed_connections
            ),
        }
    }
}

/// Delivers forward events to an optional status sink.
///
/// Cloning shares the sink slot, so a sink registered after the forwarder
/// has started still reaches its background tasks.
#[derive(Clone, Default)]
pub struct StatusEmitter {
    sink: Arc<RwLock<Option<StatusSink>>>,
}

impl StatusEmitter {
    /// Create an emitter with no sink (events are dropped)
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: StatusSink) {
        *self.sink.write() = Some(sink);
    }

    pub fn clear_sink(&self) {
        *self.sink.write() = None;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Render `event` and pass it to the sink, if any
    pub fn emit(&self, event: &ForwardEvent) {
        // Never call the sink with the lock held
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(event.severity(), &event.message());
        }
    }
}

impl std::fmt::Debug for StatusEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEmitter")
            .field("has_sink", &self.has_sink())
            .finish()
    }
}
