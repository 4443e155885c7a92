//! Streams a byte source into an open large object in fixed-size chunks.

use std::num::NonZeroUsize;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::UploadError,
    session::{LargeObjectHandle, LargeObjectSession},
    store::LargeObjectConnection,
};

/// Cooperative cancellation shared between a caller and its upload. Checked
/// at chunk boundaries only.
#[derive(Debug, Clone, Default)]
pub struct UploadCancellation {
    token: CancellationToken,
}

impl UploadCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub bytes_written: u64,
    pub chunks_written: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedWriter {
    chunk_size: NonZeroUsize,
}

impl ChunkedWriter {
    pub fn new(chunk_size: NonZeroUsize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    /// Drains `source` into `handle`, one write per full chunk plus a final
    /// partial one. Stops at the first failure without closing the handle or
    /// finishing the transaction; that is left to the caller.
    pub async fn write_all<C, R>(
        &self,
        session: &mut LargeObjectSession<'_, C>,
        handle: &LargeObjectHandle,
        source: &mut R,
        cancellation: &UploadCancellation,
    ) -> Result<WriteSummary, UploadError>
    where
        C: LargeObjectConnection,
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; self.chunk_size.get()];
        let mut summary = WriteSummary::default();

        loop {
            if cancellation.is_cancelled() {
                return Err(UploadError::Cancelled {
                    offset: summary.bytes_written,
                });
            }

            let filled = fill_chunk(source, &mut buffer).await.map_err(|err| {
                UploadError::file(
                    format!("failed to read source at byte offset {}", summary.bytes_written),
                    err,
                )
            })?;
            if filled == 0 {
                break;
            }

            session
                .write(handle, &buffer[..filled])
                .await
                .map_err(|source| UploadError::Write {
                    offset: summary.bytes_written,
                    source,
                })?;
            summary.bytes_written += filled as u64;
            summary.chunks_written += 1;
            trace!(
                chunk = summary.chunks_written,
                bytes = filled,
                offset = summary.bytes_written,
                "chunk written"
            );
        }

        Ok(summary)
    }
}

/// Reads until `buffer` is full or the source is exhausted, so short reads
/// never produce short chunks.
async fn fill_chunk<R>(source: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let read = source.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
