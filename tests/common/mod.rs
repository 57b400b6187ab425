//! Shared test doubles for the forwarding integration tests
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use nodetunnel::{BoxedChannel, PortForwarder, ProxyError, ProxySession, ProxyTarget, Severity};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(10);

enum Backend {
    /// Every channel is a TCP connection to this address
    Tcp(SocketAddr),
    /// Every channel is an in-memory pipe; the far end goes to the test
    Duplex(mpsc::UnboundedSender<DuplexStream>),
}

/// Management session double with scriptable failures
pub struct ScriptedSession {
    backend: Backend,
    fail_first: usize,
    broken_after_failures: usize,
    attempts: AtomicUsize,
}

impl ScriptedSession {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            backend: Backend::Tcp(addr),
            fail_first: 0,
            broken_after_failures: 0,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn duplex() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            backend: Backend::Duplex(tx),
            fail_first: 0,
            broken_after_failures: 0,
            attempts: AtomicUsize::new(0),
        };
        (session, rx)
    }

    /// Refuse the first `n` channel requests
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Hand out `n` channels whose writes fail, after any refused requests
    pub fn broken_first(mut self, n: usize) -> Self {
        self.broken_after_failures = n;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxySession for ScriptedSession {
    async fn open_proxy_channel(&self, target: &ProxyTarget) -> Result<BoxedChannel, ProxyError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(ProxyError::NodeOffline(format!(
                "agent on node {} is not connected",
                target.node_id
            )));
        }
        if attempt < self.fail_first + self.broken_after_failures {
            return Ok(Box::new(BrokenChannel));
        }

        match &self.backend {
            Backend::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            Backend::Duplex(tx) => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                tx.send(far).map_err(|_| ProxyError::Disconnected)?;
                Ok(Box::new(near))
            }
        }
    }

    fn resolve_display_name(&self, node_id: u32) -> String {
        format!("test-node-{}", node_id)
    }
}

/// Channel that never yields data and rejects every write
struct BrokenChannel;

impl AsyncRead for BrokenChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "proxy channel broken")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Loopback server echoing every byte back on each connection
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

pub type StatusLog = Arc<Mutex<Vec<(Severity, String)>>>;

/// Capture every status line the forwarder reports
pub fn record_status(forwarder: &PortForwarder) -> StatusLog {
    let log: StatusLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    forwarder.set_status_sink(move |severity, message| {
        sink.lock().push((severity, message.to_string()));
    });
    log
}

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
