//! Injected configuration for the store connection and the upload itself.
//!
//! Nothing here has a built-in endpoint or credential. Values come from the
//! environment (`from_env`) or from any key lookup (`from_lookup`), which is
//! what the tests use.

use std::{env, fmt, num::NonZeroUsize, str::FromStr, time::Duration};

use thiserror::Error;

/// Buffer size used per `lowrite` call unless overridden.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_DATABASE: &str = "postgres";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            other => Err(format!("unknown ssl mode: {other}")),
        }
    }
}

/// Where and how to reach the store. Opaque to the protocol.
#[derive(Clone)]
pub struct StoreConfig {
    /// Full connection URL; when present it takes precedence over the
    /// individual fields below.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub ssl_mode: SslMode,
    pub connect_timeout: Duration,
    /// `0` opens one dedicated connection per upload.
    pub pool_max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            database: DEFAULT_DATABASE.to_string(),
            ssl_mode: SslMode::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pool_max_connections: 0,
        }
    }
}

// Credentials never reach logs through `{:?}`.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool_max_connections", &self.pool_max_connections)
            .finish()
    }
}

impl StoreConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let url = non_empty(&lookup, "PGLOB_DATABASE_URL").or_else(|| non_empty(&lookup, "DATABASE_URL"));

        let port = match non_empty(&lookup, "PGLOB_PG_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|err| ConfigError::invalid("PGLOB_PG_PORT", &raw, err.to_string()))?,
            None => defaults.port,
        };

        let ssl_mode = match non_empty(&lookup, "PGLOB_PG_SSLMODE") {
            Some(raw) => raw
                .parse::<SslMode>()
                .map_err(|reason| ConfigError::invalid("PGLOB_PG_SSLMODE", &raw, reason))?,
            None => defaults.ssl_mode,
        };

        let connect_timeout = match non_empty(&lookup, "PGLOB_CONNECT_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::invalid(
                        "PGLOB_CONNECT_TIMEOUT_SECS",
                        &raw,
                        "must be greater than zero",
                    ))
                }
                Ok(secs) => Duration::from_secs(secs),
                Err(err) => {
                    return Err(ConfigError::invalid(
                        "PGLOB_CONNECT_TIMEOUT_SECS",
                        &raw,
                        err.to_string(),
                    ))
                }
            },
            None => defaults.connect_timeout,
        };

        let pool_max_connections = match non_empty(&lookup, "PGLOB_POOL_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|err| {
                ConfigError::invalid("PGLOB_POOL_MAX_CONNECTIONS", &raw, err.to_string())
            })?,
            None => defaults.pool_max_connections,
        };

        Ok(Self {
            url,
            host: non_empty(&lookup, "PGLOB_PG_HOST").unwrap_or(defaults.host),
            port,
            username: non_empty(&lookup, "PGLOB_PG_USER"),
            password: lookup("PGLOB_PG_PASSWORD"),
            database: non_empty(&lookup, "PGLOB_PG_DATABASE").unwrap_or(defaults.database),
            ssl_mode,
            connect_timeout,
            pool_max_connections,
        })
    }

    pub fn is_pooled(&self) -> bool {
        self.pool_max_connections > 0
    }
}

/// Protocol tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    pub chunk_size: NonZeroUsize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl UploadConfig {
    pub fn with_chunk_size(chunk_size: NonZeroUsize) -> Self {
        Self { chunk_size }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match non_empty(&lookup, "PGLOB_CHUNK_SIZE") {
            None => Ok(Self::default()),
            Some(raw) => {
                let parsed = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|err| ConfigError::invalid("PGLOB_CHUNK_SIZE", &raw, err.to_string()))?;
                NonZeroUsize::new(parsed)
                    .map(Self::with_chunk_size)
                    .ok_or_else(|| {
                        ConfigError::invalid("PGLOB_CHUNK_SIZE", &raw, "must be greater than zero")
                    })
            }
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.url, None);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "postgres");
        assert!(!config.is_pooled());

        let upload = UploadConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(upload.chunk_size.get(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn prefers_dedicated_url_over_database_url() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://fallback/db"),
            ("PGLOB_DATABASE_URL", "postgres://primary/db"),
        ]))
        .unwrap();
        assert_eq!(config.url.as_deref(), Some("postgres://primary/db"));
    }

    #[test]
    fn parses_individual_fields() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("PGLOB_PG_HOST", "db.internal"),
            ("PGLOB_PG_PORT", "6543"),
            ("PGLOB_PG_USER", "uploader"),
            ("PGLOB_PG_PASSWORD", "s3cret"),
            ("PGLOB_PG_DATABASE", "media"),
            ("PGLOB_PG_SSLMODE", "REQUIRE"),
            ("PGLOB_CONNECT_TIMEOUT_SECS", "3"),
            ("PGLOB_POOL_MAX_CONNECTIONS", "4"),
        ]))
        .unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6543);
        assert_eq!(config.username.as_deref(), Some("uploader"));
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.database, "media");
        assert_eq!(config.ssl_mode, SslMode::Require);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert!(config.is_pooled());
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let config = StoreConfig {
            url: Some("postgres://u:hunter2@h/db".into()),
            password: Some("hunter2".into()),
            ..StoreConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn rejects_bad_port() {
        let err = StoreConfig::from_lookup(lookup(&[("PGLOB_PG_PORT", "seventy")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PGLOB_PG_PORT", .. }));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = UploadConfig::from_lookup(lookup(&[("PGLOB_CHUNK_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("must be greater than zero"));
    }

    #[test]
    fn parses_chunk_size() {
        let config = UploadConfig::from_lookup(lookup(&[("PGLOB_CHUNK_SIZE", " 65536 ")])).unwrap();
        assert_eq!(config.chunk_size.get(), 65_536);
    }
}
