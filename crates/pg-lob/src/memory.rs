//! Transactional in-memory large-object store.
//!
//! Behaves like `pg_largeobject` closely enough to exercise the protocol:
//! objects created or written inside a transaction only become visible on
//! commit, rollback discards them together with every open descriptor, and
//! descriptors die with their transaction. Faults can be injected per
//! operation and every open/close is counted so tests can assert that nothing
//! leaks.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::StoreError,
    store::{Connector, LargeObjectConnection, Oid},
};

const FIRST_OID: u32 = 16_384;

/// Which operations should fail. Write counters are 1-based and count every
/// write attempt made against the store.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub refuse_connect: bool,
    pub fail_begin: bool,
    pub fail_allocate: bool,
    pub fail_open: bool,
    pub fail_write_call: Option<usize>,
    pub short_write_call: Option<usize>,
    pub fail_close: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_release: bool,
}

/// Counters observed by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub connections_opened: usize,
    pub connections_released: usize,
    pub open_connections: usize,
    /// Connections dropped without `release` (e.g. a panicking task).
    pub dropped_without_release: usize,
    /// Releases that found a transaction still in progress.
    pub released_mid_transaction: usize,
    pub transactions_begun: usize,
    pub open_transactions: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub handles_opened: usize,
    pub handles_closed: usize,
    pub open_handles: usize,
    pub last_open_mode: Option<i32>,
    pub write_calls: usize,
    /// Sizes of the writes the store accepted, in order.
    pub chunk_sizes: Vec<usize>,
}

impl StoreStats {
    /// True when no connection, transaction or descriptor is left open.
    pub fn is_quiescent(&self) -> bool {
        self.open_connections == 0 && self.open_transactions == 0 && self.open_handles == 0
    }
}

#[derive(Debug)]
struct Inner {
    next_oid: u32,
    next_fd: i32,
    objects: HashMap<Oid, Vec<u8>>,
    faults: FaultPlan,
    stats: StoreStats,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_oid: FIRST_OID,
            next_fd: 0,
            objects: HashMap::new(),
            faults: FaultPlan::default(),
            stats: StoreStats::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let store = Self::new();
        store.set_faults(faults);
        store
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.inner.lock().faults = faults;
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats.clone()
    }

    /// Whether a committed object with this id exists.
    pub fn contains(&self, oid: Oid) -> bool {
        self.inner.lock().objects.contains_key(&oid)
    }

    pub fn read_object(&self, oid: Oid) -> Option<Vec<u8>> {
        self.inner.lock().objects.get(&oid).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, StoreError> {
        let mut inner = self.inner.lock();
        if inner.faults.refuse_connect {
            return Err(StoreError::Rejected("connection refused".into()));
        }
        inner.stats.connections_opened += 1;
        inner.stats.open_connections += 1;
        Ok(MemoryConnection {
            store: self.inner.clone(),
            tx: None,
            released: false,
        })
    }
}

#[derive(Debug)]
struct Descriptor {
    oid: Oid,
    position: usize,
}

/// Pending state of one transaction.
#[derive(Debug, Default)]
struct PendingTx {
    /// Working copies of every object created or opened in this transaction.
    objects: HashMap<Oid, Vec<u8>>,
    descriptors: HashMap<i32, Descriptor>,
}

#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<Mutex<Inner>>,
    tx: Option<PendingTx>,
    released: bool,
}

impl MemoryConnection {
    fn finish_tx(&mut self, inner: &mut Inner) -> Option<PendingTx> {
        let tx = self.tx.take()?;
        inner.stats.open_transactions -= 1;
        inner.stats.open_handles -= tx.descriptors.len();
        Some(tx)
    }
}

fn no_transaction() -> StoreError {
    StoreError::Rejected("no transaction in progress".into())
}

#[async_trait]
impl LargeObjectConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        if inner.faults.fail_begin {
            return Err(StoreError::Rejected("injected begin failure".into()));
        }
        if self.tx.is_some() {
            return Err(StoreError::Rejected(
                "there is already a transaction in progress".into(),
            ));
        }
        inner.stats.transactions_begun += 1;
        inner.stats.open_transactions += 1;
        self.tx = Some(PendingTx::default());
        Ok(())
    }

    async fn create(&mut self) -> Result<Oid, StoreError> {
        let mut inner = self.store.lock();
        if inner.faults.fail_allocate {
            return Err(StoreError::Rejected(
                "permission denied for large object creation".into(),
            ));
        }
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        let oid = Oid(inner.next_oid);
        inner.next_oid += 1;
        tx.objects.insert(oid, Vec::new());
        Ok(oid)
    }

    async fn open(&mut self, oid: Oid, mode: i32) -> Result<i32, StoreError> {
        let mut inner = self.store.lock();
        if inner.faults.fail_open {
            return Err(StoreError::Rejected("injected open failure".into()));
        }
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        if !tx.objects.contains_key(&oid) {
            let committed = inner
                .objects
                .get(&oid)
                .cloned()
                .ok_or(StoreError::NotFound(oid))?;
            tx.objects.insert(oid, committed);
        }
        let fd = inner.next_fd;
        inner.next_fd += 1;
        tx.descriptors.insert(fd, Descriptor { oid, position: 0 });
        inner.stats.handles_opened += 1;
        inner.stats.open_handles += 1;
        inner.stats.last_open_mode = Some(mode);
        Ok(fd)
    }

    async fn write(&mut self, fd: i32, chunk: &[u8]) -> Result<usize, StoreError> {
        let mut inner = self.store.lock();
        inner.stats.write_calls += 1;
        let call = inner.stats.write_calls;
        if inner.faults.fail_write_call == Some(call) {
            return Err(StoreError::Rejected(format!("injected failure on write {call}")));
        }
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        let descriptor = tx
            .descriptors
            .get_mut(&fd)
            .ok_or(StoreError::InvalidDescriptor(fd))?;
        let accepted = if inner.faults.short_write_call == Some(call) {
            chunk.len().saturating_sub(1)
        } else {
            chunk.len()
        };
        let object = tx
            .objects
            .get_mut(&descriptor.oid)
            .ok_or(StoreError::NotFound(descriptor.oid))?;
        let start = descriptor.position;
        let end = start + accepted;
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(&chunk[..accepted]);
        descriptor.position = end;
        inner.stats.chunk_sizes.push(accepted);
        Ok(accepted)
    }

    async fn close(&mut self, fd: i32) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        if inner.faults.fail_close {
            return Err(StoreError::Rejected("injected close failure".into()));
        }
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        tx.descriptors
            .remove(&fd)
            .ok_or(StoreError::InvalidDescriptor(fd))?;
        inner.stats.handles_closed += 1;
        inner.stats.open_handles -= 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let store = self.store.clone();
        let mut inner = store.lock();
        if inner.faults.fail_commit {
            return Err(StoreError::Rejected(
                "could not serialize access due to concurrent update".into(),
            ));
        }
        // COMMIT outside a transaction only warns in PostgreSQL.
        if let Some(tx) = self.finish_tx(&mut inner) {
            inner.objects.extend(tx.objects);
            inner.stats.commits += 1;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let store = self.store.clone();
        let mut inner = store.lock();
        if inner.faults.fail_rollback {
            return Err(StoreError::Rejected("injected rollback failure".into()));
        }
        inner.stats.rollbacks += 1;
        self.finish_tx(&mut inner);
        Ok(())
    }

    async fn release(mut self) -> Result<(), StoreError> {
        let store = self.store.clone();
        let mut inner = store.lock();
        self.released = true;
        inner.stats.connections_released += 1;
        inner.stats.open_connections -= 1;
        // Closing the session aborts whatever is still pending.
        if self.finish_tx(&mut inner).is_some() {
            inner.stats.released_mid_transaction += 1;
        }
        if inner.faults.fail_release {
            return Err(StoreError::Rejected("injected release failure".into()));
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let mut inner = store.lock();
        inner.stats.open_connections -= 1;
        inner.stats.dropped_without_release += 1;
        self.finish_tx(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::INV_WRITE;

    #[tokio::test]
    async fn uncommitted_objects_are_invisible_to_other_connections() {
        let store = MemoryStore::new();
        let mut writer = store.acquire().await.unwrap();
        writer.begin().await.unwrap();
        let oid = writer.create().await.unwrap();

        let mut reader = store.acquire().await.unwrap();
        reader.begin().await.unwrap();
        let err = reader.open(oid, INV_WRITE).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(missing) if missing == oid));

        reader.rollback().await.unwrap();
        writer.rollback().await.unwrap();
        reader.release().await.unwrap();
        writer.release().await.unwrap();
        assert!(store.stats().is_quiescent());
    }

    #[tokio::test]
    async fn commit_publishes_objects_and_closes_the_transaction() {
        let store = MemoryStore::new();
        let mut conn = store.acquire().await.unwrap();
        conn.begin().await.unwrap();
        let oid = conn.create().await.unwrap();
        let fd = conn.open(oid, INV_WRITE).await.unwrap();
        conn.write(fd, b"kept").await.unwrap();
        conn.close(fd).await.unwrap();
        conn.commit().await.unwrap();

        assert_eq!(store.read_object(oid).as_deref(), Some(&b"kept"[..]));
        let stats = store.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.open_transactions, 0);
        conn.release().await.unwrap();
        assert!(store.stats().is_quiescent());
    }

    #[tokio::test]
    async fn rollback_discards_created_object_and_descriptors() {
        let store = MemoryStore::new();
        let mut conn = store.acquire().await.unwrap();
        conn.begin().await.unwrap();
        let oid = conn.create().await.unwrap();
        let fd = conn.open(oid, INV_WRITE).await.unwrap();
        conn.write(fd, b"abc").await.unwrap();
        conn.rollback().await.unwrap();

        assert!(!store.contains(oid));
        assert_eq!(store.stats().open_handles, 0);
        assert!(conn.write(fd, b"d").await.is_err());
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_is_counted() {
        let store = MemoryStore::new();
        {
            let mut conn = store.acquire().await.unwrap();
            conn.begin().await.unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.dropped_without_release, 1);
        assert!(stats.is_quiescent());
    }
}
