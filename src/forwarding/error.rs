//! Port forwarding error types

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::relay::Direction;
use crate::proxy::ProxyError;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// The local listener could not be created
    #[error("Failed to bind {addr}: {}", describe_bind_failure(.source))]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The management session refused or failed to open a proxy channel
    #[error("Cannot open proxy channel to {target}: {source}")]
    ChannelSetup {
        target: String,
        #[source]
        source: ProxyError,
    },

    /// Copying bytes on an established session failed
    #[error("Relay error on session {session_id} ({direction}): {source}")]
    Relay {
        session_id: u64,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The accept loop failed for a reason other than shutdown or idle timeout
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Port forwarder already started")]
    AlreadyStarted,

    #[error("Port forwarder is closed")]
    Closed,
}

fn describe_bind_failure(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::AddrInUse => {
            "port already in use. Another application may be using this port.".to_string()
        }
        io::ErrorKind::PermissionDenied => {
            "permission denied. Ports below 1024 require elevated privileges.".to_string()
        }
        io::ErrorKind::AddrNotAvailable => {
            "address not available. The specified address is not valid on this system.".to_string()
        }
        _ => err.to_string(),
    }
}

impl serde::Serialize for ForwardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
