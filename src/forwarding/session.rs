//! Forwarding Session
//!
//! Pairs one accepted local socket with one proxy channel and runs a pump
//! per direction. The first pump to stop, for whatever reason, closes the
//! whole pair: half-open forwarding is not supported. A reaper task waits for
//! both pumps and then reports the outcome exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::error::ForwardError;
use super::registry::SessionHandle;
use super::relay::{Direction, RelayPump, DEFAULT_BUFFER_SIZE};
use crate::proxy::BoxedChannel;

/// Upper bound on flushing a FIN/close to a sink during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Final report of a terminated session
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    /// Bytes delivered local -> remote
    pub bytes_sent: u64,
    /// Bytes delivered remote -> local
    pub bytes_received: u64,
    /// First relay failure, `None` for end-of-stream or an explicit close
    pub error: Option<ForwardError>,
}

/// One local connection bridged to one proxy channel
pub struct ForwardingSession {
    handle: SessionHandle,
    local: TcpStream,
    remote: BoxedChannel,
    buffer_size: usize,
    sent_total: Option<Arc<AtomicU64>>,
    received_total: Option<Arc<AtomicU64>>,
}

type FailureSlot = Arc<Mutex<Option<(Direction, io::Error)>>>;

impl ForwardingSession {
    /// Wrap an already-open socket and channel.
    ///
    /// `cancel` closes the session when triggered; pass a child of the
    /// forwarder's token so forwarder shutdown reaches every session.
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        local: TcpStream,
        remote: BoxedChannel,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle: SessionHandle::new(id, peer_addr, cancel),
            local,
            remote,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sent_total: None,
            received_total: None,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Also count relayed bytes into forwarder-wide totals
    pub fn with_byte_counters(mut self, sent: Arc<AtomicU64>, received: Arc<AtomicU64>) -> Self {
        self.sent_total = Some(sent);
        self.received_total = Some(received);
        self
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Handle used to register and later close this session
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Spawn both pumps and the reaper on `tracker`.
    ///
    /// `on_closed` runs once, after both pumps have exited and both ends
    /// have been closed.
    pub fn start<F>(self, tracker: &TaskTracker, on_closed: F)
    where
        F: FnOnce(SessionOutcome) + Send + 'static,
    {
        let ForwardingSession {
            handle,
            local,
            remote,
            buffer_size,
            sent_total,
            received_total,
        } = self;

        let session_id = handle.id();
        let peer_addr = handle.peer_addr();
        let cancel = handle.token().clone();

        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        let mut upstream = RelayPump::new(Direction::LocalToRemote)
            .with_buffer_size(buffer_size)
            .with_counter(sent.clone());
        if let Some(total) = sent_total {
            upstream = upstream.with_counter(total);
        }

        let mut downstream = RelayPump::new(Direction::RemoteToLocal)
            .with_buffer_size(buffer_size)
            .with_counter(received.clone());
        if let Some(total) = received_total {
            downstream = downstream.with_counter(total);
        }

        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        let up = tracker.spawn(run_pump(
            session_id,
            upstream,
            local_read,
            remote_write,
            cancel.clone(),
            failure.clone(),
        ));
        let down = tracker.spawn(run_pump(
            session_id,
            downstream,
            remote_read,
            local_write,
            cancel.clone(),
            failure.clone(),
        ));

        debug!("Session {} started for {}", session_id, peer_addr);

        tracker.spawn(async move {
            reap(session_id, Direction::LocalToRemote, up, &failure).await;
            reap(session_id, Direction::RemoteToLocal, down, &failure).await;

            let error = failure.lock().take().map(|(direction, source)| ForwardError::Relay {
                session_id,
                direction,
                source,
            });

            let outcome = SessionOutcome {
                session_id,
                peer_addr,
                bytes_sent: sent.load(Ordering::Relaxed),
                bytes_received: received.load(Ordering::Relaxed),
                error,
            };
            debug!(
                "Session {} closed ({} bytes sent, {} bytes received)",
                session_id, outcome.bytes_sent, outcome.bytes_received
            );
            on_closed(outcome);
        });
    }
}

async fn run_pump<R, W>(
    session_id: u64,
    pump: RelayPump,
    mut source: R,
    mut sink: W,
    cancel: CancellationToken,
    failure: FailureSlot,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let direction = pump.direction();

    let result = tokio::select! {
        res = pump.run(&mut source, &mut sink) => Some(res),
        _ = cancel.cancelled() => None,
    };

    match result {
        Some(Ok(bytes)) => {
            debug!(
                "Session {} {}: end of stream after {} bytes",
                session_id, direction, bytes
            );
        }
        Some(Err(e)) => {
            debug!("Session {} {}: {}", session_id, direction, e);
            let mut slot = failure.lock();
            if slot.is_none() {
                *slot = Some((direction, e));
            }
        }
        None => {
            debug!("Session {} {}: closed", session_id, direction);
        }
    }

    // First pump out tears down the pair
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, sink.shutdown()).await;
}

async fn reap(session_id: u64, direction: Direction, task: JoinHandle<()>, failure: &FailureSlot) {
    if let Err(e) = task.await {
        warn!("Session {} {} pump aborted: {}", session_id, direction, e);
        let mut slot = failure.lock();
        if slot.is_none() {
            *slot = Some((direction, io::Error::other(e.to_string())));
        }
    }
}
