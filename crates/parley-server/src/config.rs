// Server configuration.
//
// Everything is read from environment variables (after `.env` has been
// loaded) with defaults suitable for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_gateway::relay::DEFAULT_PERSIST_TIMEOUT;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared secret for verifying identity-provider tokens.
    pub jwt_secret: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Upper bound on any single store call made by the relay.
    pub persist_timeout: Duration,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl ServerConfig {
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_HOST` | `0.0.0.0` |
    /// | `PARLEY_PORT` | `3000` |
    /// | `PARLEY_JWT_SECRET` | dev-only placeholder |
    /// | `PARLEY_DB_PATH` | `parley.db` |
    /// | `PARLEY_PERSIST_TIMEOUT_MS` | `5000` |
    /// | `PARLEY_LOG_FILTER` | `parley=debug,tower_http=debug` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLEY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PARLEY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let db_path = env("PARLEY_DB_PATH")
            .unwrap_or_else(|_| "parley.db".into())
            .into();

        let persist_timeout = env("PARLEY_PERSIST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PERSIST_TIMEOUT);

        let log_filter = env("PARLEY_LOG_FILTER")
            .unwrap_or_else(|_| "parley=debug,tower_http=debug".into());

        Self {
            listen_addr,
            jwt_secret,
            db_path,
            persist_timeout,
            log_filter,
        }
    }

    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
