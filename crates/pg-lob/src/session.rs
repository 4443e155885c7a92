//! One large object inside one transaction.
//!
//! The session walks a fixed state machine:
//!
//! ```text
//! Idle -> TransactionOpen -> ObjectAllocated -> HandleOpen -> HandleClosed -> Committed
//!   \___________________________ any failure ___________________________/ -> RolledBack
//! ```
//!
//! A step that is issued out of order is refused before anything reaches the
//! store. A step the store refuses leaves the session `Failed`, from which only
//! `rollback` is accepted.

use std::fmt;

use tracing::debug;

use crate::{
    error::{SessionFault, StoreError, UploadError},
    store::{LargeObjectConnection, Oid, INV_WRITE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransactionOpen,
    ObjectAllocated,
    HandleOpen,
    HandleClosed,
    Failed,
    Committed,
    RolledBack,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::TransactionOpen => "transaction_open",
            SessionState::ObjectAllocated => "object_allocated",
            SessionState::HandleOpen => "handle_open",
            SessionState::HandleClosed => "handle_closed",
            SessionState::Failed => "failed",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::RolledBack)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open write descriptor on an allocated object. Not `Clone`: closing it
/// consumes the value.
#[derive(Debug, PartialEq, Eq)]
pub struct LargeObjectHandle {
    oid: Oid,
    fd: i32,
}

impl LargeObjectHandle {
    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

pub struct LargeObjectSession<'c, C>
where
    C: LargeObjectConnection,
{
    conn: &'c mut C,
    state: SessionState,
    oid: Option<Oid>,
    fd: Option<i32>,
}

impl<'c, C> LargeObjectSession<'c, C>
where
    C: LargeObjectConnection,
{
    pub fn new(conn: &'c mut C) -> Self {
        Self {
            conn,
            state: SessionState::Idle,
            oid: None,
            fd: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The object allocated in this transaction, if any.
    pub fn oid(&self) -> Option<Oid> {
        self.oid
    }

    pub async fn begin(&mut self) -> Result<(), UploadError> {
        self.expect_state("begin", SessionState::Idle)
            .map_err(UploadError::Transaction)?;
        match self.conn.begin().await {
            Ok(()) => {
                self.state = SessionState::TransactionOpen;
                debug!("transaction started");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(UploadError::Transaction(err.into()))
            }
        }
    }

    pub async fn allocate(&mut self) -> Result<Oid, UploadError> {
        self.expect_state("allocate", SessionState::TransactionOpen)
            .map_err(UploadError::Allocation)?;
        match self.conn.create().await {
            Ok(oid) => {
                self.oid = Some(oid);
                self.state = SessionState::ObjectAllocated;
                debug!(%oid, "large object allocated");
                Ok(oid)
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(UploadError::Allocation(err.into()))
            }
        }
    }

    /// Opens `oid` write-only. Only the object allocated by this session can
    /// be opened.
    pub async fn open_write(&mut self, oid: Oid) -> Result<LargeObjectHandle, UploadError> {
        self.expect_state("open", SessionState::ObjectAllocated)
            .map_err(UploadError::Handle)?;
        if self.oid != Some(oid) {
            self.state = SessionState::Failed;
            return Err(UploadError::Handle(StoreError::NotFound(oid).into()));
        }
        match self.conn.open(oid, INV_WRITE).await {
            Ok(fd) => {
                self.fd = Some(fd);
                self.state = SessionState::HandleOpen;
                debug!(%oid, fd, "large object opened for writing");
                Ok(LargeObjectHandle { oid, fd })
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(UploadError::Handle(err.into()))
            }
        }
    }

    /// Writes one chunk at the handle's current position. A short write is a
    /// failure.
    pub async fn write(
        &mut self,
        handle: &LargeObjectHandle,
        chunk: &[u8],
    ) -> Result<(), SessionFault> {
        self.expect_handle("write", handle)?;
        match self.conn.write(handle.fd, chunk).await {
            Ok(written) if written == chunk.len() => Ok(()),
            Ok(written) => {
                self.state = SessionState::Failed;
                Err(StoreError::ShortWrite {
                    written,
                    expected: chunk.len(),
                }
                .into())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(err.into())
            }
        }
    }

    pub async fn close_write(&mut self, handle: LargeObjectHandle) -> Result<(), UploadError> {
        self.expect_handle("close", &handle)
            .map_err(UploadError::Handle)?;
        match self.conn.close(handle.fd).await {
            Ok(()) => {
                self.fd = None;
                self.state = SessionState::HandleClosed;
                debug!(oid = %handle.oid, fd = handle.fd, "large object closed");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(UploadError::Handle(err.into()))
            }
        }
    }

    /// Commits the transaction. Only legal once a handle has been opened and
    /// closed, so an allocated but never written object cannot be committed.
    pub async fn commit(&mut self) -> Result<Oid, UploadError> {
        self.expect_state("commit", SessionState::HandleClosed)
            .map_err(UploadError::Transaction)?;
        let oid = self.oid.ok_or(UploadError::Transaction(SessionFault::InvalidState {
            operation: "commit",
            state: self.state,
        }))?;
        match self.conn.commit().await {
            Ok(()) => {
                self.state = SessionState::Committed;
                debug!(%oid, "transaction committed");
                Ok(oid)
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(UploadError::Commit(err.into()))
            }
        }
    }

    /// Discards everything since `begin`. A no-op before `begin` and after a
    /// previous rollback. Any outstanding handle is invalid afterwards, even
    /// when the store reports an error.
    pub async fn rollback(&mut self) -> Result<(), UploadError> {
        match self.state {
            SessionState::Idle | SessionState::RolledBack => return Ok(()),
            SessionState::Committed => {
                return Err(UploadError::Transaction(SessionFault::InvalidState {
                    operation: "rollback",
                    state: self.state,
                }))
            }
            _ => {}
        }

        let outcome = self.conn.rollback().await;
        self.fd = None;
        self.state = SessionState::RolledBack;
        match outcome {
            Ok(()) => {
                debug!(oid = ?self.oid, "transaction rolled back");
                Ok(())
            }
            Err(err) => Err(UploadError::Transaction(err.into())),
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(), SessionFault> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionFault::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn expect_handle(
        &self,
        operation: &'static str,
        handle: &LargeObjectHandle,
    ) -> Result<(), SessionFault> {
        self.expect_state(operation, SessionState::HandleOpen)?;
        if self.fd != Some(handle.fd) || self.oid != Some(handle.oid) {
            return Err(StoreError::InvalidDescriptor(handle.fd).into());
        }
        Ok(())
    }
}
