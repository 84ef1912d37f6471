/// Optional Redis backing for the query-embedding cache and usage counters.
///
/// Nothing here returns an error. A missing URL, a refused connection, or a failed
/// command is logged and reported as a miss, so callers compute from source instead.
use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

#[derive(Clone, Default)]
pub struct RedisCache {
    client: Option<redis::Client>,
}

impl RedisCache {
    /// A cache for `url`, or a permanently disabled one when the URL is absent or invalid.
    pub fn new(url: Option<&str>) -> Self {
        let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
            debug!("no redis url configured");
            return Self::default();
        };
        match redis::Client::open(url) {
            Ok(client) => Self {
                client: Some(client),
            },
            Err(e) => {
                warn!(error = %e, url, "invalid redis url, cache disabled");
                Self::default()
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    async fn connection(&self) -> Option<MultiplexedConnection> {
        let client = self.client.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, "redis connection failed");
                None
            }
        }
    }

    /// PING round-trip.
    pub async fn is_available(&self) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key, "redis GET failed");
                None
            }
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(error = %e, key, "redis SETEX failed");
            return false;
        }
        true
    }

    pub async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> bool {
        self.hincr_many(key, &[(field, delta)]).await
    }

    /// Apply several hash increments in one atomic pipeline.
    pub async fn hincr_many(&self, key: &str, increments: &[(&str, i64)]) -> bool {
        if increments.is_empty() {
            return true;
        }
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, delta) in increments {
            pipe.hincr(key, *field, *delta).ignore();
        }
        if let Err(e) = pipe.query_async::<()>(&mut conn).await {
            warn!(error = %e, key, fields = increments.len(), "redis HINCRBY pipeline failed");
            return false;
        }
        true
    }

    /// Every field of a hash; `None` when Redis cannot be reached.
    pub async fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        conn.hgetall::<_, HashMap<String, String>>(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis HGETALL failed"))
            .ok()
    }
}
