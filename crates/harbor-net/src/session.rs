//! Session identity and the per-transport session table.
//!
//! Session ids are process-unique: every transport draws from the same
//! [`IdGenerator`], so an id never collides across services.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

/// Unique identifier for a session within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`SessionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide session id source.
pub(crate) static SESSION_IDS: IdGenerator = IdGenerator::new();

/// How a session came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Accepted by a listener.
    Accepted,
    /// Opened by a blocking connect.
    Connected,
    /// Opened by an asynchronous connect.
    AsyncConnected,
}

/// Descriptive data about a session, handed to event callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Local socket address.
    pub local_addr: SocketAddr,
    /// Remote socket address.
    pub peer_addr: SocketAddr,
    /// How the session was created.
    pub origin: SessionOrigin,
}

/// Live bookkeeping for one session.
pub(crate) struct SessionEntry {
    pub(crate) info: SessionInfo,
    /// Frames queued for the writer task.
    pub(crate) outbound: mpsc::UnboundedSender<Bytes>,
    /// Carries the close reason to the reader task.
    pub(crate) close_tx: watch::Sender<Option<String>>,
}

/// Error returned when the session table is at capacity.
#[derive(Debug)]
pub struct SessionLimitReached;

/// Concurrent map of live sessions keyed by [`SessionId`].
pub(crate) struct SessionTable {
    inner: DashMap<SessionId, SessionEntry>,
    /// Reserved slots; bumped before an entry lands in `inner`.
    occupied: AtomicUsize,
    max_sessions: usize,
}

impl SessionTable {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            inner: DashMap::new(),
            occupied: AtomicUsize::new(0),
            max_sessions,
        }
    }

    /// Insert a session. Fails if the table is at capacity.
    pub(crate) fn insert(&self, entry: SessionEntry) -> Result<(), SessionLimitReached> {
        let max = self.max_sessions;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| SessionLimitReached)?;
        if self.inner.insert(entry.info.id, entry).is_some() {
            // Replaced an entry with the same id; it already held a slot.
            self.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<SessionEntry> {
        let removed = self.inner.remove(&id).map(|(_, entry)| entry);
        if removed.is_some() {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.inner.contains_key(&id)
    }

    /// Queue a frame on a session. Returns `false` if the session is unknown
    /// or its writer has gone away.
    pub(crate) fn enqueue(&self, id: SessionId, frame: Bytes) -> bool {
        match self.inner.get(&id) {
            Some(entry) => entry.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub(crate) fn info(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner.get(&id).map(|entry| entry.info.clone())
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Remove every session, signalling each reader with `reason`.
    pub(crate) fn close_all(&self, reason: &str) {
        for id in self.ids() {
            if let Some(entry) = self.remove(id) {
                entry.close_tx.send_replace(Some(reason.to_string()));
            }
        }
    }
}
