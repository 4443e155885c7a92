//! Thin platform-bridge adapter around the `pg-lob` core.
//!
//! Mirrors a mobile method channel: each request names a method and its
//! arguments, and each gets exactly one JSON-encoded [`UploadResult`] back.

pub mod telemetry;

use anyhow::{Context, Result};
use pg_lob::{Connector, FailureKind, UploadResult, Uploader};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

pub const SAVE_LARGE_OBJECT: &str = "saveLargeObject";

/// One inbound call, e.g. `{"method":"saveLargeObject","filePath":"/tmp/a.jpg"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCall {
    pub method: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

pub async fn dispatch<K>(uploader: &Uploader<K>, call: BridgeCall) -> UploadResult
where
    K: Connector + 'static,
{
    if call.method != SAVE_LARGE_OBJECT {
        return UploadResult::failure(
            FailureKind::NotImplemented,
            format!("method '{}' is not implemented", call.method),
        );
    }

    match call.file_path.filter(|path| !path.trim().is_empty()) {
        Some(path) => {
            info!(file_path = %path, "saveLargeObject received");
            uploader.spawn(path).wait().await
        }
        None => UploadResult::failure(FailureKind::InvalidArgument, "filePath is required"),
    }
}

/// Answers JSON-line calls from `input` until it is exhausted. Returns the
/// number of calls handled.
pub async fn serve<K, R, W>(uploader: &Uploader<K>, input: R, mut output: W) -> Result<usize>
where
    K: Connector + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await.context("reading bridge input")? {
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<BridgeCall>(&line) {
            Ok(call) => dispatch(uploader, call).await,
            Err(err) => {
                debug!(error = %err, "malformed bridge call");
                UploadResult::failure(
                    FailureKind::InvalidArgument,
                    format!("malformed request: {err}"),
                )
            }
        };
        write_result(&mut output, &result).await?;
        handled += 1;
    }

    Ok(handled)
}

pub async fn write_result<W>(output: &mut W, result: &UploadResult) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(result).context("encoding upload result")?;
    line.push(b'\n');
    output.write_all(&line).await.context("writing upload result")?;
    output.flush().await.context("flushing upload result")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pg_lob::{memory::MemoryStore, UploadConfig};
    use serde_json::Value;
    use tempfile::tempdir;

    use super::*;

    fn uploader(store: &MemoryStore) -> Uploader<MemoryStore> {
        Uploader::new(store.clone(), UploadConfig::default())
    }

    fn call(method: &str, file_path: Option<&str>) -> BridgeCall {
        BridgeCall {
            method: method.to_string(),
            file_path: file_path.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_not_implemented() {
        let store = MemoryStore::new();
        let result = dispatch(&uploader(&store), call("deleteLargeObject", Some("/x"))).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NotImplemented));
        assert_eq!(store.stats().connections_opened, 0);
    }

    #[tokio::test]
    async fn missing_path_is_invalid_argument() {
        let store = MemoryStore::new();
        let result = dispatch(&uploader(&store), call(SAVE_LARGE_OBJECT, None)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::InvalidArgument));

        let result = dispatch(&uploader(&store), call(SAVE_LARGE_OBJECT, Some("  "))).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::InvalidArgument));
    }

    #[tokio::test]
    async fn saves_file_through_dispatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, b"\x89PNG fake").unwrap();

        let store = MemoryStore::new();
        let result = dispatch(
            &uploader(&store),
            call(SAVE_LARGE_OBJECT, Some(path.to_str().unwrap())),
        )
        .await;

        assert!(result.is_success());
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn serve_answers_every_line_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, b"clip").unwrap();

        let input = format!(
            "{{\"method\":\"saveLargeObject\",\"filePath\":{}}}\n\nnot json\n{{\"method\":\"ping\"}}\n",
            serde_json::to_string(path.to_str().unwrap()).unwrap()
        );
        let store = MemoryStore::new();
        let mut output = Vec::new();

        let handled = serve(&uploader(&store), input.as_bytes(), &mut output)
            .await
            .unwrap();
        assert_eq!(handled, 3);

        let replies: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["status"], "success");
        assert!(replies[0]["oid"].as_str().is_some());
        assert_eq!(replies[1]["kind"], "invalid_argument");
        assert_eq!(replies[2]["kind"], "not_implemented");
    }
}
