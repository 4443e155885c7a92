//! PostgreSQL connections for the large-object protocol (sqlx).
//!
//! Each protocol step is a single statement with bound parameters:
//! `lo_create(0)`, `lo_open($1, $2)`, `lowrite($1, $2)`, `lo_close($1)`.
//! Transaction control goes over the simple-query protocol.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    pool::PoolConnection,
    postgres::{types::Oid as PgOid, PgConnectOptions, PgPoolOptions, PgSslMode},
    Connection, Executor, PgConnection, PgPool, Postgres,
};
use tracing::{debug, info, warn};

use crate::{
    config::{SslMode, StoreConfig},
    error::StoreError,
    store::{Connector, LargeObjectConnection, Oid},
};

/// SQLSTATE `undefined_object`, raised by `lo_open` for a missing OID.
const UNDEFINED_OBJECT: &str = "42704";

/// Hands out PostgreSQL connections, either freshly connected per upload or
/// checked out of a pool.
#[derive(Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
    pool: Option<PgPool>,
}

impl PgConnector {
    /// Builds a connector from injected configuration. No connection is made
    /// until the first `acquire`. Must be called inside a tokio runtime when
    /// pooling is enabled.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = connect_options(config)?;

        if config.url.is_some() {
            info!(
                pooled = config.is_pooled(),
                "configured PostgreSQL large-object connector from URL"
            );
        } else {
            info!(
                host = %config.host,
                port = config.port,
                database = %config.database,
                username = config.username.as_deref().unwrap_or("<default>"),
                ssl_mode = ?config.ssl_mode,
                pooled = config.is_pooled(),
                "configured PostgreSQL large-object connector"
            );
        }

        let pool = config.is_pooled().then(|| {
            PgPoolOptions::new()
                .max_connections(config.pool_max_connections)
                .acquire_timeout(config.connect_timeout)
                .connect_lazy_with(options.clone())
        });

        Ok(Self {
            options,
            connect_timeout: config.connect_timeout,
            pool,
        })
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }
}

// The connect options hold the password.
impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

fn connect_options(config: &StoreConfig) -> Result<PgConnectOptions, StoreError> {
    if let Some(url) = &config.url {
        return Ok(PgConnectOptions::from_str(url)?);
    }

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .ssl_mode(match config.ssl_mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
        })
        .application_name("pg-lob");

    if let Some(user) = &config.username {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    Ok(options)
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgLargeObjectConnection;

    async fn acquire(&self) -> Result<PgLargeObjectConnection, StoreError> {
        let conn = match &self.pool {
            Some(pool) => PgHandle::Pooled(pool.acquire().await?),
            None => {
                let connect = PgConnection::connect_with(&self.options);
                let conn = tokio::time::timeout(self.connect_timeout, connect)
                    .await
                    .map_err(|_| StoreError::Timeout(self.connect_timeout))??;
                PgHandle::Dedicated(conn)
            }
        };
        Ok(PgLargeObjectConnection {
            conn,
            in_doubt: false,
        })
    }
}

enum PgHandle {
    Dedicated(PgConnection),
    Pooled(PoolConnection<Postgres>),
}

/// One exclusively owned PostgreSQL connection.
pub struct PgLargeObjectConnection {
    conn: PgHandle,
    /// Set when COMMIT or ROLLBACK failed, so the transaction state on the
    /// server is unknown and the connection must not be pooled again.
    in_doubt: bool,
}

impl PgLargeObjectConnection {
    fn raw(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            PgHandle::Dedicated(conn) => conn,
            PgHandle::Pooled(conn) => conn,
        }
    }

    async fn simple(&mut self, statement: &'static str) -> Result<(), StoreError> {
        self.raw().execute(statement).await?;
        Ok(())
    }
}

#[async_trait]
impl LargeObjectConnection for PgLargeObjectConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.simple("BEGIN").await
    }

    async fn create(&mut self) -> Result<Oid, StoreError> {
        let oid: PgOid = sqlx::query_scalar("SELECT lo_create(0)")
            .fetch_one(self.raw())
            .await?;
        Ok(Oid(oid.0))
    }

    async fn open(&mut self, oid: Oid, mode: i32) -> Result<i32, StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT lo_open($1, $2)")
            .bind(PgOid(oid.0))
            .bind(mode)
            .fetch_one(self.raw())
            .await
            .map_err(|err| {
                let missing = err
                    .as_database_error()
                    .and_then(|db| db.code())
                    .is_some_and(|code| code == UNDEFINED_OBJECT);
                if missing {
                    StoreError::NotFound(oid)
                } else {
                    StoreError::Database(err)
                }
            })
    }

    async fn write(&mut self, fd: i32, chunk: &[u8]) -> Result<usize, StoreError> {
        let written: i32 = sqlx::query_scalar("SELECT lowrite($1, $2)")
            .bind(fd)
            .bind(chunk)
            .fetch_one(self.raw())
            .await?;
        usize::try_from(written).map_err(|_| StoreError::InvalidDescriptor(fd))
    }

    async fn close(&mut self, fd: i32) -> Result<(), StoreError> {
        let status: i32 = sqlx::query_scalar("SELECT lo_close($1)")
            .bind(fd)
            .fetch_one(self.raw())
            .await?;
        if status < 0 {
            return Err(StoreError::InvalidDescriptor(fd));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let outcome = self.simple("COMMIT").await;
        self.in_doubt |= outcome.is_err();
        outcome
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let outcome = self.simple("ROLLBACK").await;
        self.in_doubt |= outcome.is_err();
        outcome
    }

    async fn release(self) -> Result<(), StoreError> {
        let in_doubt = self.in_doubt;
        match self.conn {
            PgHandle::Dedicated(conn) => {
                conn.close().await?;
                debug!("dedicated connection closed");
            }
            PgHandle::Pooled(conn) if in_doubt => {
                warn!("closing pooled connection with unknown transaction state");
                conn.detach().close().await?;
            }
            PgHandle::Pooled(conn) => {
                drop(conn);
                debug!("connection returned to pool");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_options_from_fields() {
        let config = StoreConfig {
            host: "db.internal".into(),
            port: 6543,
            username: Some("uploader".into()),
            password: Some("s3cret".into()),
            database: "media".into(),
            ssl_mode: SslMode::Disable,
            ..StoreConfig::default()
        };
        assert!(connect_options(&config).is_ok());
    }

    #[test]
    fn malformed_url_is_rejected() {
        let config = StoreConfig::from_url("not a url");
        assert!(matches!(
            connect_options(&config),
            Err(StoreError::Database(_))
        ));
    }

    #[test]
    fn debug_output_hides_connect_options() {
        let config = StoreConfig {
            password: Some("hunter2".into()),
            ..StoreConfig::default()
        };
        let connector = PgConnector::new(&config).unwrap();
        let rendered = format!("{connector:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("pooled: false"));
    }
}
