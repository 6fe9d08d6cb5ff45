use log::warn;
use std::time::Duration;

use crate::tickets::constants::{
    DEFAULT_FEED_CAPACITY, DEFAULT_REQUEST_TIMEOUT_MS, MIN_FEED_CAPACITY, MIN_REQUEST_TIMEOUT_MS,
};
use crate::tickets::session::AdminCredentials;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub sync: SyncConfig,
    pub admin: Option<AdminCredentials>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Settings shared by the client-side coordinator and conversation manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub request_timeout: Duration,
    pub feed_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match get("SUPPORT_DESK_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SUPPORT_DESK_PORT {raw:?}: {e}"))?,
            None => 8080,
        };
        let server = ServerConfig {
            host: get("SUPPORT_DESK_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
        };

        let database = get("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: get("DATABASE_MAX_CONNECTIONS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            });

        let timeout_ms = get("SUPPORT_DESK_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let timeout_ms = if timeout_ms < MIN_REQUEST_TIMEOUT_MS {
            warn!("Request timeout {timeout_ms}ms is too low, using {MIN_REQUEST_TIMEOUT_MS}ms");
            MIN_REQUEST_TIMEOUT_MS
        } else {
            timeout_ms
        };

        let capacity = get("SUPPORT_DESK_FEED_CAPACITY")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_FEED_CAPACITY);
        let capacity = if capacity < MIN_FEED_CAPACITY {
            warn!("Feed capacity {capacity} is too low, using {MIN_FEED_CAPACITY}");
            MIN_FEED_CAPACITY
        } else {
            capacity
        };

        let admin = match (
            get("SUPPORT_DESK_ADMIN_USERNAME"),
            get("SUPPORT_DESK_ADMIN_PASSWORD"),
        ) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(AdminCredentials::new(user, pass))
            }
            (None, None) => None,
            _ => {
                warn!("Staff login disabled: set both SUPPORT_DESK_ADMIN_USERNAME and SUPPORT_DESK_ADMIN_PASSWORD");
                None
            }
        };

        Ok(Self {
            server,
            database,
            sync: SyncConfig {
                request_timeout: Duration::from_millis(timeout_ms),
                feed_capacity: capacity,
            },
            admin,
        })
    }
}
