use std::collections::HashMap;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Per-host connection pools for the admin user.
///
/// At most one cached pool per target host. A cached pool is pinged before
/// reuse; on ping failure it is discarded and a fresh connection is made,
/// so a bounced server never leaves us holding a dead socket.
pub struct PgPools {
    username: String,
    password: String,
    port: u16,
    pools: tokio::sync::Mutex<HashMap<String, PgPool>>,
}

impl PgPools {
    pub fn new(username: impl Into<String>, password: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            port,
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get a live pool for `host`, recycling the cached one when its ping
    /// succeeds.
    pub async fn get(&self, host: &str) -> Result<PgPool, sqlx::Error> {
        let mut pools = self.pools.lock().await;

        if let Some(pool) = pools.get(host) {
            match sqlx::query("SELECT 1").execute(pool).await {
                Ok(_) => return Ok(pool.clone()),
                Err(e) => {
                    tracing::debug!(host, "cached connection failed ping, reconnecting: {}", e);
                    pool.close().await;
                    pools.remove(host);
                }
            }
        }

        let url = format!(
            "postgres://{}:{}@{}:{}/postgres",
            self.username, self.password, host, self.port
        );
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;
        pools.insert(host.to_string(), pool.clone());
        tracing::debug!(host, "connected");
        Ok(pool)
    }

    /// Drop the cached pool for `host`, closing its connections.
    pub async fn discard(&self, host: &str) {
        if let Some(pool) = self.pools.lock().await.remove(host) {
            pool.close().await;
        }
    }
}
