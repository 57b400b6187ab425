//! Port Forwarder
//!
//! Forwards connections from a local port to a port on a managed node,
//! through proxy channels opened on the management session.
//! Example: forward 127.0.0.1:<ephemeral> -> node 1042:5900 (VNC)
//!
//! # Lifecycle
//!
//! ```ignore
//! let target = ProxyTarget::new(1042, 5900);
//! let forwarder = PortForwarder::new(session, target, ForwarderConfig::default());
//! let port = forwarder.start().await?;
//! // ... point a client at 127.0.0.1:port ...
//! forwarder.close().await;
//! ```
//!
//! Every accepted connection gets its own proxy channel and its own
//! [`ForwardingSession`], so one failing connection never affects another.
//! An accept error caused by a single client aborting its handshake
//! (`ConnectionAborted`, `ConnectionReset`, `Interrupted`) is skipped; any
//! other accept error ends the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::ForwarderConfig;
use super::error::ForwardError;
use super::events::{AcceptExit, ForwardEvent, Severity, StatusEmitter};
use super::placeholders::expand_local_endpoint;
use super::registry::{SessionInfo, SessionRegistry};
use super::session::{ForwardingSession, SessionOutcome};
use super::stats::{ForwardStats, ForwardStatsAtomic};
use crate::proxy::{ProxySession, ProxyTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwarderState {
    Idle,
    Starting,
    Running(SocketAddr),
    Closed(Option<SocketAddr>),
}

/// State shared with the accept task and session reapers
struct Shared {
    forward_id: String,
    registry: SessionRegistry,
    stats: ForwardStatsAtomic,
    emitter: StatusEmitter,
    accepting: AtomicBool,
}

impl Shared {
    fn session_finished(&self, outcome: SessionOutcome, target_label: &str, local_port: u16) {
        if self.registry.remove(outcome.session_id).is_some() {
            self.stats.session_closed();
        }

        match outcome.error {
            Some(err) => {
                warn!("[{}] {}", self.forward_id, err);
                self.emitter.emit(&ForwardEvent::RelayFailed {
                    forward_id: self.forward_id.clone(),
                    session_id: outcome.session_id,
                    local_port,
                    target: target_label.to_string(),
                    error: err.to_string(),
                });
            }
            None => {
                debug!(
                    "[{}] Connection #{} from {} closed",
                    self.forward_id, outcome.session_id, outcome.peer_addr
                );
                self.emitter.emit(&ForwardEvent::SessionClosed {
                    forward_id: self.forward_id.clone(),
                    session_id: outcome.session_id,
                    bytes_sent: outcome.bytes_sent,
                    bytes_received: outcome.bytes_received,
                });
            }
        }
    }
}

/// Local TCP listener relaying every accepted connection to a remote target
pub struct PortForwarder {
    id: String,
    target: ProxyTarget,
    config: ForwarderConfig,
    proxy: Arc<dyn ProxySession>,
    shared: Arc<Shared>,
    state: Mutex<ForwarderState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PortForwarder {
    pub fn new(proxy: Arc<dyn ProxySession>, target: ProxyTarget, config: ForwarderConfig) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            shared: Arc::new(Shared {
                forward_id: id.clone(),
                registry: SessionRegistry::new(),
                stats: ForwardStatsAtomic::default(),
                emitter: StatusEmitter::noop(),
                accepting: AtomicBool::new(false),
            }),
            id,
            target,
            config,
            proxy,
            state: Mutex::new(ForwarderState::Idle),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Bind the local listener and start accepting connections.
    ///
    /// Returns the bound port once the accept task is waiting for
    /// connections, so a client may connect as soon as this returns.
    pub async fn start(&self) -> Result<u16, ForwardError> {
        {
            let mut state = self.state.lock();
            match *state {
                ForwarderState::Idle => *state = ForwarderState::Starting,
                ForwarderState::Starting | ForwarderState::Running(_) => {
                    return Err(ForwardError::AlreadyStarted)
                }
                ForwarderState::Closed(_) => return Err(ForwardError::Closed),
            }
        }

        let bind_addr = self.config.bind_addr();
        let bound = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                let err = ForwardError::Bind {
                    addr: bind_addr,
                    source,
                };
                error!("[{}] {}", self.id, err);
                self.abandon_start();
                return Err(err);
            }
        };

        let target_label = self.target_label();
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            if matches!(*state, ForwarderState::Closed(_)) {
                debug!("[{}] Closed while binding {}", self.id, local_addr);
                return Err(ForwardError::Closed);
            }
            *state = ForwarderState::Running(local_addr);
            self.shared.accepting.store(true, Ordering::SeqCst);

            // Spawn under the state lock: a racing close() sees the task tracked
            let ctx = AcceptContext {
                shared: self.shared.clone(),
                proxy: self.proxy.clone(),
                target: self.target,
                target_label: target_label.clone(),
                local_port: local_addr.port(),
                idle_timeout: self.config.idle_timeout(),
                buffer_size: self.config.effective_buffer_size(),
                nodelay: self.config.nodelay,
                cancel: self.cancel.clone(),
                tracker: self.tracker.clone(),
            };
            self.tracker.spawn(ctx.run(listener, ready_tx));
        }

        if ready_rx.await.is_err() {
            return Err(ForwardError::Closed);
        }

        info!(
            "[{}] Started port forward: {} -> {}",
            self.id, local_addr, target_label
        );
        self.shared.emitter.emit(&ForwardEvent::Listening {
            forward_id: self.id.clone(),
            local_addr,
            target: target_label,
        });

        Ok(local_addr.port())
    }

    /// Stop accepting, close every session and wait for all background
    /// tasks to finish. Safe to call repeatedly and concurrently.
    pub async fn close(&self) {
        let first = {
            let mut state = self.state.lock();
            match *state {
                ForwarderState::Closed(_) => false,
                ForwarderState::Running(addr) => {
                    *state = ForwarderState::Closed(Some(addr));
                    true
                }
                ForwarderState::Idle | ForwarderState::Starting => {
                    *state = ForwarderState::Closed(None);
                    true
                }
            }
        };

        if first {
            info!("[{}] Stopping port forward", self.id);
            self.cancel.cancel();
            let signalled = self.shared.registry.close_all();
            debug!("[{}] Closing {} active sessions", self.id, signalled);
            self.tracker.close();
        }

        self.tracker.wait().await;

        if first {
            let stats = self.stats();
            info!(
                "[{}] Port forward stopped ({} connections handled)",
                self.id, stats.connection_count
            );
            self.shared.emitter.emit(&ForwardEvent::Closed {
                forward_id: self.id.clone(),
                stats,
            });
        }
    }

    /// Register the callback that receives status lines
    pub fn set_status_sink<F>(&self, sink: F)
    where
        F: Fn(Severity, &str) + Send + Sync + 'static,
    {
        self.shared.emitter.set_sink(Arc::new(sink));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> ProxyTarget {
        self.target
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Bound listener address, once `start()` has succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock() {
            ForwarderState::Running(addr) => Some(addr),
            ForwarderState::Closed(addr) => addr,
            _ => None,
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ForwarderState::Running(_))
    }

    /// Whether the accept task is still taking new connections.
    /// Turns false after close, idle timeout or a fatal accept error.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.shared.stats.to_stats()
    }

    /// Live sessions ordered by id
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.registry.infos()
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.registry.len()
    }

    /// Substitute `${local-address}` and `${local-port}` with the bound
    /// listener address. `None` before `start()`.
    pub fn expand_placeholders(&self, template: &str) -> Option<String> {
        self.local_addr()
            .map(|addr| expand_local_endpoint(template, addr.ip(), addr.port()))
    }

    fn target_label(&self) -> String {
        let name = self.proxy.resolve_display_name(self.target.node_id);
        if self.target.via_agent_loopback {
            format!("{} port {} (agent loopback)", name, self.target.remote_port)
        } else {
            format!("{} port {}", name, self.target.remote_port)
        }
    }

    fn abandon_start(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, ForwarderState::Closed(_)) {
                *state = ForwarderState::Closed(None);
            }
        }
        self.cancel.cancel();
        self.tracker.close();
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwarder")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Everything the accept task needs, detached from the forwarder
struct AcceptContext {
    shared: Arc<Shared>,
    proxy: Arc<dyn ProxySession>,
    target: ProxyTarget,
    target_label: String,
    local_port: u16,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    nodelay: bool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl AcceptContext {
    async fn run(self, listener: TcpListener, ready: oneshot::Sender<()>) {
        let forward_id = self.shared.forward_id.clone();

        // Readiness barrier: start() returns once we are about to accept
        let _ = ready.send(());

        let (reason, failure) = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break (AcceptExit::Closed, None),
                res = accept_next(&listener, self.idle_timeout) => res,
            };

            match accepted {
                Ok(Some((stream, peer_addr))) => {
                    if !self.forward_connection(stream, peer_addr).await {
                        break (AcceptExit::Closed, None);
                    }
                }
                Ok(None) => {
                    info!(
                        "[{}] No connection within idle timeout, closing listener on port {}",
                        forward_id, self.local_port
                    );
                    break (AcceptExit::IdleTimeout, None);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("[{}] Connection aborted before accept: {}", forward_id, e);
                }
                Err(e) => {
                    let err = ForwardError::Accept(e);
                    error!("[{}] {}", forward_id, err);
                    break (AcceptExit::Failed, Some(err.to_string()));
                }
            }
        };

        drop(listener);
        self.shared.accepting.store(false, Ordering::SeqCst);
        debug!("[{}] Accept loop exited: {:?}", forward_id, reason);

        self.shared.emitter.emit(&ForwardEvent::AcceptLoopExited {
            forward_id,
            local_port: self.local_port,
            reason,
            error: failure,
        });
    }

    /// Open a proxy channel for one accepted connection and start its
    /// session. Returns false if the forwarder was closed meanwhile.
    async fn forward_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> bool {
        let forward_id = &self.shared.forward_id;
        self.shared
            .stats
            .connection_count
            .fetch_add(1, Ordering::Relaxed);

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        debug!("[{}] Accepted connection from {}", forward_id, peer_addr);

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            res = self.proxy.open_proxy_channel(&self.target) => res,
        };

        let channel = match opened {
            Ok(channel) => channel,
            Err(source) => {
                drop(stream);
                self.shared
                    .stats
                    .failed_connections
                    .fetch_add(1, Ordering::Relaxed);

                let cause = source.to_string();
                let err = ForwardError::ChannelSetup {
                    target: self.target_label.clone(),
                    source,
                };
                warn!(
                    "[{}] {} (connection from {} on local port {} dropped)",
                    forward_id, err, peer_addr, self.local_port
                );
                self.shared.emitter.emit(&ForwardEvent::ChannelSetupFailed {
                    forward_id: forward_id.clone(),
                    peer_addr,
                    local_port: self.local_port,
                    target: self.target_label.clone(),
                    error: cause,
                });
                return true;
            }
        };

        let session_id = self.shared.registry.next_id();
        let session = ForwardingSession::new(
            session_id,
            peer_addr,
            stream,
            channel,
            self.cancel.child_token(),
        )
        .with_buffer_size(self.buffer_size)
        .with_byte_counters(
            self.shared.stats.bytes_sent.clone(),
            self.shared.stats.bytes_received.clone(),
        );

        self.shared.registry.insert(session.handle());
        self.shared.stats.session_opened();

        info!(
            "[{}] Connection #{} from {} forwarded to {}",
            forward_id, session_id, peer_addr, self.target_label
        );
        self.shared.emitter.emit(&ForwardEvent::ConnectionAccepted {
            forward_id: forward_id.clone(),
            session_id,
            peer_addr,
            target: self.target_label.clone(),
        });

        let shared = self.shared.clone();
        let target_label = self.target_label.clone();
        let local_port = self.local_port;
        session.start(&self.tracker, move |outcome| {
            shared.session_finished(outcome, &target_label, local_port);
        });

        true
    }
}

/// Wait for the next connection. `Ok(None)` means the idle timeout elapsed.
async fn accept_next(
    listener: &TcpListener,
    idle_timeout: Option<Duration>,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        },
        None => listener.accept().await.map(Some),
    }
}

/// Errors caused by a single client giving up during the handshake
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
