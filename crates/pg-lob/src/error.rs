//! Error taxonomy and the single result handed back to bridges.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{session::SessionState, store::Oid};

/// Errors raised by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("large object {0} does not exist")]
    NotFound(Oid),
    #[error("invalid large-object descriptor {0}")]
    InvalidDescriptor(i32),
    #[error("store accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
}

/// Why a session step failed: either the store refused it, or the step was
/// not legal in the session's current state.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

/// Every way an upload can fail. One variant per [`FailureKind`].
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not connect to the store: {0}")]
    Connection(#[source] StoreError),
    #[error("{detail}: {source}")]
    File {
        detail: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transaction failed: {0}")]
    Transaction(#[source] SessionFault),
    #[error("could not allocate large object: {0}")]
    Allocation(#[source] SessionFault),
    #[error("large-object handle failed: {0}")]
    Handle(#[source] SessionFault),
    #[error("write failed at byte offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: SessionFault,
    },
    #[error("commit failed: {0}")]
    Commit(#[source] SessionFault),
    #[error("could not release store connection: {0}")]
    Release(#[source] StoreError),
    #[error("upload cancelled after {offset} bytes")]
    Cancelled { offset: u64 },
    #[error("{0}")]
    Internal(String),
}

impl UploadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UploadError::Connection(_) => FailureKind::ConnectionError,
            UploadError::File { .. } => FailureKind::FileError,
            UploadError::Transaction(_) => FailureKind::TransactionError,
            UploadError::Allocation(_) => FailureKind::AllocationError,
            UploadError::Handle(_) => FailureKind::HandleError,
            UploadError::Write { .. } => FailureKind::WriteError,
            UploadError::Commit(_) => FailureKind::CommitError,
            UploadError::Release(_) => FailureKind::ReleaseError,
            UploadError::Cancelled { .. } => FailureKind::Cancelled,
            UploadError::Internal(_) => FailureKind::Internal,
        }
    }

    pub(crate) fn file(detail: impl Into<String>, source: std::io::Error) -> Self {
        UploadError::File {
            detail: detail.into(),
            source,
        }
    }

    pub fn into_result(self) -> UploadResult {
        UploadResult::Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Kind tag carried by [`UploadResult::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionError,
    FileError,
    TransactionError,
    AllocationError,
    HandleError,
    WriteError,
    CommitError,
    ReleaseError,
    Cancelled,
    Internal,
    InvalidArgument,
    NotImplemented,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectionError => "connection_error",
            FailureKind::FileError => "file_error",
            FailureKind::TransactionError => "transaction_error",
            FailureKind::AllocationError => "allocation_error",
            FailureKind::HandleError => "handle_error",
            FailureKind::WriteError => "write_error",
            FailureKind::CommitError => "commit_error",
            FailureKind::ReleaseError => "release_error",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
            FailureKind::InvalidArgument => "invalid_argument",
            FailureKind::NotImplemented => "not_implemented",
        }
    }
}

/// Outcome of one upload request: an OID or a single tagged failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadResult {
    Success { oid: String },
    Failure { kind: FailureKind, message: String },
}

impl UploadResult {
    pub fn success(oid: Oid) -> Self {
        UploadResult::Success {
            oid: oid.to_string(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        UploadResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadResult::Success { .. })
    }

    pub fn oid(&self) -> Option<&str> {
        match self {
            UploadResult::Success { oid } => Some(oid),
            UploadResult::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            UploadResult::Success { .. } => None,
            UploadResult::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl From<UploadError> for UploadResult {
    fn from(err: UploadError) -> Self {
        err.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_serializes_with_status_tag() {
        let json = serde_json::to_value(UploadResult::success(Oid(16_433))).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["oid"], "16433");
    }

    #[test]
    fn failure_carries_kind_and_message() {
        let err = UploadError::Write {
            offset: 24,
            source: SessionFault::Store(StoreError::Rejected("disk full".into())),
        };
        let result = err.into_result();

        assert_eq!(result.failure_kind(), Some(FailureKind::WriteError));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], FailureKind::WriteError.as_str());
        assert!(json["message"].as_str().unwrap().contains("offset 24"));
    }

    #[test]
    fn invalid_state_message_names_the_state() {
        let fault = SessionFault::InvalidState {
            operation: "commit",
            state: SessionState::ObjectAllocated,
        };
        assert_eq!(
            fault.to_string(),
            "commit is not allowed while the session is object_allocated"
        );
    }
}
