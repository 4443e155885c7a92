//! Upload orchestration: acquire, transact, release, report exactly once.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    fs::File,
    io::AsyncRead,
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::UploadConfig,
    error::{FailureKind, UploadError, UploadResult},
    session::LargeObjectSession,
    store::{Connector, LargeObjectConnection, Oid},
    writer::{ChunkedWriter, UploadCancellation, WriteSummary},
};

/// A byte source plus its declared length, if known. The caller keeps
/// ownership; uploads only borrow it.
pub struct UploadRequest<R> {
    source: R,
    length: Option<u64>,
}

impl UploadRequest<File> {
    /// Opens a local file for upload. Failure is a `FileError`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|err| UploadError::file(format!("cannot open {}", path.display()), err))?;
        let length = file
            .metadata()
            .await
            .map_err(|err| UploadError::file(format!("cannot stat {}", path.display()), err))?
            .len();
        Ok(Self {
            source: file,
            length: Some(length),
        })
    }
}

impl<R> UploadRequest<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn from_reader(source: R, length: Option<u64>) -> Self {
        Self { source, length }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }
}

/// What a successful upload produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub oid: Oid,
    pub bytes_written: u64,
    pub chunks_written: u64,
}

/// Runs uploads against one connector. Cheap to clone.
pub struct Uploader<K>
where
    K: Connector,
{
    connector: Arc<K>,
    writer: ChunkedWriter,
}

impl<K> Clone for Uploader<K>
where
    K: Connector,
{
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            writer: self.writer,
        }
    }
}

impl<K> Uploader<K>
where
    K: Connector + 'static,
{
    pub fn new(connector: K, config: UploadConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            writer: ChunkedWriter::new(config.chunk_size),
        }
    }

    /// The bridge-facing operation: upload the file at `path` and return its
    /// OID or a single failure.
    pub async fn save_large_object(&self, path: impl AsRef<Path>) -> UploadResult {
        self.save_with_cancellation(path.as_ref(), &UploadCancellation::new())
            .await
    }

    /// Uploads a caller-owned source.
    pub async fn upload<R>(&self, request: &mut UploadRequest<R>) -> UploadResult
    where
        R: AsyncRead + Unpin + Send,
    {
        match self
            .upload_with_receipt(request, &UploadCancellation::new())
            .await
        {
            Ok(receipt) => UploadResult::success(receipt.oid),
            Err(err) => err.into_result(),
        }
    }

    /// Runs the full protocol and returns the receipt or the primary error.
    #[instrument(
        name = "upload",
        skip(self, request, cancellation),
        fields(
            upload_id = %Uuid::new_v4(),
            declared_len = ?request.length(),
            chunk_size = self.writer.chunk_size()
        )
    )]
    pub async fn upload_with_receipt<R>(
        &self,
        request: &mut UploadRequest<R>,
        cancellation: &UploadCancellation,
    ) -> Result<UploadReceipt, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if cancellation.is_cancelled() {
            return Err(UploadError::Cancelled { offset: 0 });
        }

        let mut conn = match self.connector.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                let err = UploadError::Connection(err);
                warn!(kind = err.kind().as_str(), error = %err, "store connection unavailable");
                return Err(err);
            }
        };
        debug!("store connection acquired");

        let outcome = self.transact(&mut conn, request, cancellation).await;

        if let Err(err) = conn.release().await {
            let err = UploadError::Release(err);
            warn!(error = %err, "releasing store connection failed");
        }

        match &outcome {
            Ok(receipt) => info!(
                oid = %receipt.oid,
                bytes = receipt.bytes_written,
                chunks = receipt.chunks_written,
                "large object uploaded"
            ),
            Err(err) => warn!(kind = err.kind().as_str(), error = %err, "large object upload failed"),
        }
        outcome
    }

    /// Runs uploads of `path` on a background task. The task always reaches
    /// commit or rollback and releases its connection, even if the returned
    /// [`UploadTask`] is dropped.
    pub fn spawn(&self, path: impl Into<PathBuf>) -> UploadTask {
        let path = path.into();
        let (sender, receiver) = oneshot::channel();
        let cancellation = UploadCancellation::new();
        let uploader = self.clone();
        let task_cancellation = cancellation.clone();

        let handle = tokio::spawn(
            async move {
                let result = uploader
                    .save_with_cancellation(&path, &task_cancellation)
                    .await;
                if sender.send(result).is_err() {
                    debug!("upload finished after its caller went away");
                }
            }
            .in_current_span(),
        );

        UploadTask {
            receiver,
            cancellation,
            handle,
        }
    }

    async fn save_with_cancellation(
        &self,
        path: &Path,
        cancellation: &UploadCancellation,
    ) -> UploadResult {
        let mut request = match UploadRequest::<File>::open(path).await {
            Ok(request) => request,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot open upload source");
                return err.into_result();
            }
        };
        let outcome = self.upload_with_receipt(&mut request, cancellation).await;
        // Close the file before the caller sees the result.
        drop(request);
        match outcome {
            Ok(receipt) => UploadResult::success(receipt.oid),
            Err(err) => err.into_result(),
        }
    }

    /// Everything between `BEGIN` and the end of the transaction. On any
    /// failure the transaction is rolled back before returning.
    async fn transact<C, R>(
        &self,
        conn: &mut C,
        request: &mut UploadRequest<R>,
        cancellation: &UploadCancellation,
    ) -> Result<UploadReceipt, UploadError>
    where
        C: LargeObjectConnection,
        R: AsyncRead + Unpin + Send,
    {
        let mut session = LargeObjectSession::new(conn);
        match self.write_object(&mut session, request, cancellation).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(
                        primary = %err,
                        error = %rollback_err,
                        "rollback after failed upload did not complete"
                    );
                } else {
                    debug!(oid = ?session.oid(), "upload rolled back");
                }
                Err(err)
            }
        }
    }

    async fn write_object<C, R>(
        &self,
        session: &mut LargeObjectSession<'_, C>,
        request: &mut UploadRequest<R>,
        cancellation: &UploadCancellation,
    ) -> Result<UploadReceipt, UploadError>
    where
        C: LargeObjectConnection,
        R: AsyncRead + Unpin + Send,
    {
        session.begin().await?;
        let oid = session.allocate().await?;
        let handle = session.open_write(oid).await?;
        let WriteSummary {
            bytes_written,
            chunks_written,
        } = self
            .writer
            .write_all(session, &handle, &mut request.source, cancellation)
            .await?;
        if let Some(declared) = request.length() {
            if declared != bytes_written {
                warn!(declared, bytes_written, "source length changed during upload");
            }
        }
        session.close_write(handle).await?;
        session.commit().await?;

        Ok(UploadReceipt {
            oid,
            bytes_written,
            chunks_written,
        })
    }
}

/// Handle to a spawned upload. Its result can be taken once.
pub struct UploadTask {
    receiver: oneshot::Receiver<UploadResult>,
    cancellation: UploadCancellation,
    handle: JoinHandle<()>,
}

impl UploadTask {
    /// Asks the upload to stop at the next chunk boundary and roll back.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> UploadResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => lost_result(self.handle).await,
        }
    }

    /// Waits up to `limit`. On expiry the upload is cancelled and still driven
    /// to its terminal state; if it managed to commit anyway, the OID is
    /// returned rather than dropped.
    pub async fn wait_timeout(self, limit: Duration) -> UploadResult {
        let UploadTask {
            mut receiver,
            cancellation,
            handle,
        } = self;

        match tokio::time::timeout(limit, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => lost_result(handle).await,
            Err(_) => {
                cancellation.cancel();
                warn!(?limit, "upload timed out; cancelling");
                match receiver.await {
                    Ok(UploadResult::Failure {
                        kind: FailureKind::Cancelled,
                        ..
                    }) => UploadResult::failure(
                        FailureKind::Cancelled,
                        format!("upload timed out after {limit:?}"),
                    ),
                    Ok(result) => result,
                    Err(_) => lost_result(handle).await,
                }
            }
        }
    }
}

async fn lost_result(handle: JoinHandle<()>) -> UploadResult {
    let message = match handle.await {
        Err(err) if err.is_panic() => "upload task panicked".to_string(),
        Err(err) => format!("upload task aborted: {err}"),
        Ok(()) => "upload task finished without a result".to_string(),
    };
    UploadError::Internal(message).into_result()
}
