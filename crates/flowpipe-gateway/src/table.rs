//! The connection table: id allocation and the set of live connections.
//!
//! Readers (downstream dispatch) take a short shared lock to clone a handle;
//! admission and retirement take the exclusive lock. No lock is held across
//! an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::ConnId;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    Closing,
    Closed,
}

/// Work queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Data(Bytes),
    Close,
}

/// One admitted connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    remote_address: String,
    state: ConnState,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionRecord {
    pub fn new(
        remote_address: impl Into<String>,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote_address: remote_address.into(),
            state: ConnState::Active,
            outbound,
            cancel,
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn state(&self) -> ConnState {
        self.state
    }
}

/// A cloneable view of a live connection, used to queue work without
/// holding the table lock.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnId,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Queue bytes for the connection. Returns `false` if the writer is gone.
    pub async fn send(&self, body: Bytes) -> bool {
        self.outbound.send(Outbound::Data(body)).await.is_ok()
    }

    /// Ask the writer to close the transport after pending data.
    ///
    /// Falls back to cancellation if the writer is already gone.
    pub async fn close(&self) {
        if self.outbound.send(Outbound::Close).await.is_err() {
            self.cancel.cancel();
        }
    }
}

#[derive(Debug)]
pub struct ConnectionTable {
    records: RwLock<HashMap<ConnId, ConnectionRecord>>,
    next_id: AtomicU64,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next connection id. Ids are never reused.
    pub fn allocate_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `id` was ever handed out by [`allocate_id`](Self::allocate_id).
    pub fn was_issued(&self, id: ConnId) -> bool {
        id.0 >= 1 && id.0 < self.next_id.load(Ordering::Relaxed)
    }

    pub fn insert(&self, id: ConnId, record: ConnectionRecord) {
        self.write().insert(id, record);
    }

    /// A handle for a live (active or closing) connection.
    pub fn handle(&self, id: ConnId) -> Option<ConnectionHandle> {
        self.read().get(&id).map(|record| ConnectionHandle {
            id,
            outbound: record.outbound.clone(),
            cancel: record.cancel.clone(),
        })
    }

    /// Move an active connection to `Closing`. Returns `false` if unknown.
    pub fn mark_closing(&self, id: ConnId) -> bool {
        match self.write().get_mut(&id) {
            Some(record) => {
                if record.state == ConnState::Active {
                    record.state = ConnState::Closing;
                }
                true
            }
            None => false,
        }
    }

    /// Remove the connection, returning its final record.
    ///
    /// Only the first call for an id returns `Some`.
    pub fn retire(&self, id: ConnId) -> Option<ConnectionRecord> {
        let mut record = self.write().remove(&id)?;
        record.state = ConnState::Closed;
        record.cancel.cancel();
        Some(record)
    }

    /// Current state; `Closed` for retired ids, `None` for ids never issued.
    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        match self.read().get(&id) {
            Some(record) => Some(record.state),
            None if self.was_issued(id) => Some(ConnState::Closed),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnId, ConnectionRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnId, ConnectionRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> (ConnectionRecord, mpsc::Receiver<Outbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        (ConnectionRecord::new("127.0.0.1:1", tx, cancel.clone()), rx, cancel)
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let table = ConnectionTable::new();
        assert!(!table.was_issued(ConnId(1)));
        assert_eq!(table.allocate_id(), ConnId(1));
        assert_eq!(table.allocate_id(), ConnId(2));
        assert_eq!(table.allocate_id(), ConnId(3));
        assert!(table.was_issued(ConnId(3)));
        assert!(!table.was_issued(ConnId(0)));
        assert!(!table.was_issued(ConnId(4)));
    }

    #[test]
    fn lifecycle_states() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (rec, _rx, cancel) = record();
        table.insert(id, rec);

        assert_eq!(table.state(id), Some(ConnState::Active));
        assert!(table.mark_closing(id));
        assert_eq!(table.state(id), Some(ConnState::Closing));

        let retired = table.retire(id).unwrap();
        assert_eq!(retired.state(), ConnState::Closed);
        assert_eq!(retired.remote_address(), "127.0.0.1:1");
        assert!(cancel.is_cancelled());

        assert_eq!(table.state(id), Some(ConnState::Closed));
        assert!(table.handle(id).is_none());
        assert!(!table.mark_closing(id));
        assert_eq!(table.state(ConnId(99)), None);
    }

    #[test]
    fn retire_is_once_only() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (rec, _rx, _cancel) = record();
        table.insert(id, rec);

        assert!(table.retire(id).is_some());
        assert!(table.retire(id).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn handle_queues_in_order() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (rec, mut rx, _cancel) = record();
        table.insert(id, rec);
        assert_eq!(table.len(), 1);

        let handle = table.handle(id).unwrap();
        assert!(handle.send(Bytes::from_static(b"a")).await);
        handle.close().await;

        assert!(matches!(rx.recv().await, Some(Outbound::Data(b)) if b.as_ref() == b"a"));
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
    }

    #[tokio::test]
    async fn close_without_writer_cancels() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (rec, rx, cancel) = record();
        table.insert(id, rec);
        drop(rx);

        let handle = table.handle(id).unwrap();
        assert!(!handle.send(Bytes::from_static(b"a")).await);
        handle.close().await;
        assert!(cancel.is_cancelled());
    }
}
