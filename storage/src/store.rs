use deadpool_redis::redis::{cmd, AsyncCommands};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use log::{debug, warn};

use crate::error::Result;

/// Upper bound on pooled connections. Borrowed connections are validated
/// with a PING by the pool manager before reuse.
const MAX_CONNECTIONS: usize = 100;

/// Key→string store with a per-write TTL, backing the last-message slots.
///
/// Only startup treats the store as critical: `connect` verifies the store
/// answers. After that every failure is logged and collapsed into a miss, so
/// a flaky cache never disturbs dispatch.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    key_ttl: u64,
}

impl Store {
    /// Builds the connection pool and verifies the store answers a PING.
    /// `key_ttl` is the lifetime of written keys in seconds; 0 keeps keys
    /// until overwritten.
    pub async fn connect(url: &str, key_ttl: u64) -> Result<Store> {
        let mut config = Config::from_url(url);
        config.pool = Some(PoolConfig::new(MAX_CONNECTIONS));

        let pool = config.create_pool(Some(Runtime::Tokio1))?;
        let store = Store { pool, key_ttl };

        let mut connection = store.pool.get().await?;
        cmd("PING").query_async::<_, String>(&mut connection).await?;

        Ok(store)
    }

    /// Reads a key. A missing key and an unreachable store both come back
    /// as None.
    pub async fn get(&self, key: &str) -> Option<String> {
        debug!("Getting key '{key}' from cache.");

        let mut connection = match self.pool.get().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!("Cache unavailable: {err}");
                return None;
            }
        };

        match connection.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Cache read of key '{key}' failed: {err}");
                None
            }
        }
    }

    /// Writes a key with the configured TTL. Failures are logged and
    /// ignored.
    pub async fn set(&self, key: &str, value: &str) {
        debug!("Setting key '{key}' to cache.");

        let mut connection = match self.pool.get().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!("Cache unavailable: {err}");
                return;
            }
        };

        let written = if self.key_ttl == 0 {
            cmd("SET")
                .arg(key)
                .arg(value)
                .query_async::<_, ()>(&mut connection)
                .await
        } else {
            cmd("SETEX")
                .arg(key)
                .arg(self.key_ttl)
                .arg(value)
                .query_async::<_, ()>(&mut connection)
                .await
        };

        if let Err(err) = written {
            warn!("Cache write of key '{key}' failed: {err}");
        }
    }

    /// Returns true when the key exists. Unreachable stores count as a
    /// missing key.
    pub async fn has_key(&self, key: &str) -> bool {
        let mut connection = match self.pool.get().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!("Cache unavailable: {err}");
                return false;
            }
        };

        match connection.exists::<_, bool>(key).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!("Cache lookup of key '{key}' failed: {err}");
                false
            }
        }
    }

    /// Returns true iff the store answers a PING.
    pub async fn ping(&self) -> bool {
        let Ok(mut connection) = self.pool.get().await else {
            return false;
        };

        matches!(
            cmd("PING")
                .query_async::<_, String>(&mut connection)
                .await
                .as_deref(),
            Ok("PONG")
        )
    }

    /// Closes the pool; subsequent calls report the store as unavailable.
    pub fn close(&self) {
        self.pool.close();
    }
}
