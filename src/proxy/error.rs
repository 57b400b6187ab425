//! Proxy channel error types

use thiserror::Error;

/// Failure reported by the management session when a proxy channel
/// cannot be opened.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Node offline: {0}")]
    NodeOffline(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Management session disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    Other(String),
}

// Errors cross the status boundary as plain strings
impl serde::Serialize for ProxyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
