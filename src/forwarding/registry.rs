//! Session Registry
//!
//! Tracks the live forwarding sessions of one forwarder. The accept task
//! inserts, session reapers remove, and `close()` iterates a snapshot so that
//! removals racing with a bulk close never invalidate the iteration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Cloneable control handle for a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    peer_addr: SocketAddr,
    opened_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(id: u64, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer_addr,
            opened_at: Utc::now(),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Close both ends of the session. Repeated calls are no-ops.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            opened_at: self.opened_at,
        }
    }
}

/// Serializable description of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub opened_at: DateTime<Utc>,
}

/// Live sessions keyed by sequence number
#[derive(Debug, Default)]
pub struct SessionRegistry {
    last_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id. Ids start at 1 and are never reused.
    pub fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock();
        sessions.insert(handle.id, handle);
    }

    pub fn remove(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.lock().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Copy of the current handles, taken under the lock
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Live sessions ordered by id
    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.snapshot().iter().map(SessionHandle::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Close every registered session, returning how many were signalled.
    ///
    /// Entries are left in place; each session removes itself once its
    /// pumps have exited.
    pub fn close_all(&self) -> usize {
        let handles = self.snapshot();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}
