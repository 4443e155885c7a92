//! Runs the protocol against a live PostgreSQL server. Tests that need one
//! are skipped unless `DATABASE_URL` is set.

use std::{num::NonZeroUsize, time::Duration};

use anyhow::{Context, Result};
use pg_lob::{
    Connector, FailureKind, LargeObjectConnection, Oid, PgConnector, StoreConfig, StoreError,
    UploadConfig, UploadRequest, Uploader, INV_WRITE,
};
use sqlx::{postgres::types::Oid as PgOid, Connection, PgConnection};

fn database_url() -> Option<String> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("DATABASE_URL not set; skipping PostgreSQL integration test");
            None
        }
    }
}

async fn stored_bytes(url: &str, oid: Oid) -> Result<Option<Vec<u8>>> {
    let mut conn = PgConnection::connect(url).await?;
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_largeobject_metadata WHERE oid = $1)",
    )
    .bind(PgOid(oid.0))
    .fetch_one(&mut conn)
    .await?;
    if !exists {
        conn.close().await?;
        return Ok(None);
    }
    let bytes: Vec<u8> = sqlx::query_scalar("SELECT lo_get($1)")
        .bind(PgOid(oid.0))
        .fetch_one(&mut conn)
        .await?;
    sqlx::query("SELECT lo_unlink($1)")
        .bind(PgOid(oid.0))
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    Ok(Some(bytes))
}

#[tokio::test]
async fn uploads_and_commits_large_object() -> Result<()> {
    let Some(url) = database_url() else {
        return Ok(());
    };
    let connector = PgConnector::new(&StoreConfig::from_url(url.clone()))?;
    let uploader = Uploader::new(
        connector,
        UploadConfig::with_chunk_size(NonZeroUsize::new(1000).context("chunk")?),
    );

    let payload: Vec<u8> = (0..25_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut request = UploadRequest::from_reader(&payload[..], Some(payload.len() as u64));
    let result = uploader.upload(&mut request).await;

    let oid = Oid(result.oid().context("upload failed")?.parse()?);
    assert_eq!(stored_bytes(&url, oid).await?, Some(payload));
    Ok(())
}

#[tokio::test]
async fn empty_upload_creates_empty_object() -> Result<()> {
    let Some(url) = database_url() else {
        return Ok(());
    };
    let uploader = Uploader::new(
        PgConnector::new(&StoreConfig::from_url(url.clone()))?,
        UploadConfig::default(),
    );

    let mut request = UploadRequest::from_reader(&b""[..], Some(0));
    let result = uploader.upload(&mut request).await;

    let oid = Oid(result.oid().context("upload failed")?.parse()?);
    assert_eq!(stored_bytes(&url, oid).await?, Some(Vec::new()));
    Ok(())
}

#[tokio::test]
async fn rollback_removes_allocated_object() -> Result<()> {
    let Some(url) = database_url() else {
        return Ok(());
    };
    let connector = PgConnector::new(&StoreConfig::from_url(url.clone()))?;
    let mut conn = connector.acquire().await?;

    conn.begin().await?;
    let oid = conn.create().await?;
    let fd = conn.open(oid, INV_WRITE).await?;
    conn.write(fd, b"discarded").await?;
    conn.rollback().await?;

    conn.begin().await?;
    let err = conn.open(oid, INV_WRITE).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(missing) if missing == oid));
    conn.rollback().await?;
    conn.release().await?;

    assert_eq!(stored_bytes(&url, oid).await?, None);
    Ok(())
}

#[tokio::test]
async fn pooled_connector_uploads() -> Result<()> {
    let Some(url) = database_url() else {
        return Ok(());
    };
    let mut config = StoreConfig::from_url(url.clone());
    config.pool_max_connections = 2;
    let connector = PgConnector::new(&config)?;
    assert!(connector.pool().is_some());
    let uploader = Uploader::new(connector, UploadConfig::default());

    let mut request = UploadRequest::from_reader(&b"pooled"[..], Some(6));
    let result = uploader.upload(&mut request).await;

    let oid = Oid(result.oid().context("upload failed")?.parse()?);
    assert_eq!(stored_bytes(&url, oid).await?, Some(b"pooled".to_vec()));
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() -> Result<()> {
    let config = StoreConfig {
        host: "127.0.0.1".into(),
        port: 1,
        connect_timeout: Duration::from_secs(2),
        ..StoreConfig::default()
    };
    let uploader = Uploader::new(PgConnector::new(&config)?, UploadConfig::default());

    let mut request = UploadRequest::from_reader(&b"x"[..], Some(1));
    let result = uploader.upload(&mut request).await;

    assert_eq!(result.failure_kind(), Some(FailureKind::ConnectionError));
    Ok(())
}
