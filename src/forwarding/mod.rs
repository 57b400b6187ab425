//! Port Forwarding Module
//!
//! Exposes a local TCP port and relays every accepted connection to a port on
//! a managed node, each over its own proxy channel opened through the
//! management session.

mod config;
mod error;
mod events;
mod forwarder;
pub mod placeholders;
mod registry;
pub mod relay;
mod session;
mod stats;

pub use config::{ForwarderConfig, BROWSER_IDLE_TIMEOUT};
pub use error::ForwardError;
pub use events::{AcceptExit, ForwardEvent, Severity, StatusEmitter, StatusSink};
pub use forwarder::PortForwarder;
pub use placeholders::expand_local_endpoint;
pub use registry::{SessionHandle, SessionInfo, SessionRegistry};
pub use relay::{Direction, RelayPump, DEFAULT_BUFFER_SIZE};
pub use session::{ForwardingSession, SessionOutcome};
pub use stats::ForwardStats;
