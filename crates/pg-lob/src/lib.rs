//! Transactional, chunked uploads into PostgreSQL large objects.
//!
//! The crate implements the upload protocol once for every platform bridge:
//! acquire a connection, `BEGIN`, allocate an object with `lo_create`, open a
//! write-only descriptor, stream the source with `lowrite` in bounded chunks,
//! `lo_close`, `COMMIT`, release. Any failure after `BEGIN` rolls the
//! transaction back so no orphaned object survives, and every request ends in
//! exactly one [`UploadResult`].
//!
//! The store sits behind the [`Connector`] / [`LargeObjectConnection`] seam.
//! [`PgConnector`] talks to PostgreSQL through sqlx. With the `test-util`
//! feature, `memory::MemoryStore` provides a transactional in-memory double
//! with fault injection.

pub mod config;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod session;
pub mod store;
pub mod upload;
pub mod writer;

pub use config::{ConfigError, SslMode, StoreConfig, UploadConfig, DEFAULT_CHUNK_SIZE};
pub use connection::{PgConnector, PgLargeObjectConnection};
pub use error::{FailureKind, SessionFault, StoreError, UploadError, UploadResult};
pub use session::{LargeObjectHandle, LargeObjectSession, SessionState};
pub use store::{Connector, LargeObjectConnection, Oid, INV_WRITE};
pub use upload::{UploadReceipt, UploadRequest, UploadTask, Uploader};
pub use writer::{ChunkedWriter, UploadCancellation, WriteSummary};
