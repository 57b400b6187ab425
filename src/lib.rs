//! NodeTunnel - session-multiplexed TCP port forwarding
//!
//! Opens a local listening port and relays every accepted connection to a
//! port on a managed node through a proxy channel of an authenticated
//! management session.

pub mod forwarding;
pub mod logging;
pub mod proxy;

pub use forwarding::{
    ForwardError, ForwardStats, ForwarderConfig, PortForwarder, Severity, SessionInfo,
};
pub use proxy::{BoxedChannel, DuplexChannel, ProxyError, ProxySession, ProxyTarget};
