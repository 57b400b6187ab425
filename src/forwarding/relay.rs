//! Relay Pump
//!
//! Unidirectional copy loop between two byte streams. The pump never closes
//! either endpoint; tearing down the pair is the owning session's job.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction buffer size, matching typical kernel socket buffers
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Which way a pump moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Local client socket -> proxy channel
    LocalToRemote,
    /// Proxy channel -> local client socket
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => f.write_str("local->remote"),
            Direction::RemoteToLocal => f.write_str("remote->local"),
        }
    }
}

/// A single copy loop from a source to a sink
#[derive(Debug, Clone)]
pub struct RelayPump {
    direction: Direction,
    buffer_size: usize,
    counters: Vec<Arc<AtomicU64>>,
}

impl RelayPump {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buffer_size: DEFAULT_BUFFER_SIZE,
            counters: Vec::new(),
        }
    }

    /// Set the chunk size (at least one byte)
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Add a byte counter bumped after every chunk written to the sink
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.counters.push(counter);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Copy until the source reports end-of-stream or either side fails.
    ///
    /// Returns the number of bytes delivered to the sink. A zero-length read
    /// into a non-empty buffer is tokio's end-of-stream, so the loop cannot
    /// spin on it.
    pub async fn run<R, W>(&self, source: &mut R, sink: &mut W) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }

            sink.write_all(&buf[..n]).await?;
            sink.flush().await?;

            total += n as u64;
            for counter in &self.counters {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
    }
}
