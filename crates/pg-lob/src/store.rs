//! Outbound contract towards the large-object store.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Open-mode flag requesting write access (`INV_WRITE` in `libpq-fs.h`).
pub const INV_WRITE: i32 = 0x0002_0000;

/// Identifier of a store-side large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub u32);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed set of store operations the upload protocol issues over one
/// connection. Implementations map each call to a single round trip and must
/// not retry internally.
#[async_trait]
pub trait LargeObjectConnection: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn create(&mut self) -> Result<Oid, StoreError>;
    /// Returns the descriptor of the opened object.
    async fn open(&mut self, oid: Oid, mode: i32) -> Result<i32, StoreError>;
    /// Writes at the descriptor's current position, returning the number of
    /// bytes the store accepted.
    async fn write(&mut self, fd: i32, chunk: &[u8]) -> Result<usize, StoreError>;
    async fn close(&mut self, fd: i32) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Gives the connection back (closed or returned to its pool). Consuming
    /// `self` makes a second release impossible.
    async fn release(self) -> Result<(), StoreError>;
}

/// Source of exclusively owned store connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: LargeObjectConnection + 'static;

    async fn acquire(&self) -> Result<Self::Connection, StoreError>;
}
