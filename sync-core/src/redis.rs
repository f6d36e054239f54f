use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing;

use crate::config::RedisConfig;
use crate::db::mask_database_url;
use crate::scope::{ResourceScope, RowEvent};

pub type RedisPool = Arc<Client>;
pub type RedisConnection = MultiplexedConnection;

/// Field of a stream entry holding the JSON-encoded [`RowEvent`].
pub const STREAM_FIELD: &str = "data";

pub async fn create_pool(config: &RedisConfig) -> Result<RedisPool> {
    tracing::info!("Setting up Redis client for push channels");
    tracing::info!("Redis URL: {}", mask_database_url(&config.url));

    let client = Client::open(config.url.as_str())
        .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

    let _pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| anyhow!("Failed to ping Redis: {}", e))?;

    tracing::info!("Redis connection established successfully!");

    Ok(Arc::new(client))
}

pub async fn get_connection(pool: &RedisPool) -> redis::RedisResult<RedisConnection> {
    pool.get_multiplexed_async_connection().await
}

/// Appends change events to scope streams after a committed write.
#[derive(Clone)]
pub struct ChangePublisher {
    pool: RedisPool,
    maxlen: usize,
}

impl ChangePublisher {
    pub fn new(pool: RedisPool, config: &RedisConfig) -> Self {
        Self {
            pool,
            maxlen: config.stream_maxlen.max(1),
        }
    }

    /// Best effort: a failed publish is logged, never surfaced, because the
    /// write it describes has already committed and subscribers compensate by
    /// re-fetching after reconnect.
    pub async fn publish(&self, scopes: &[ResourceScope], event: &RowEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to encode change event: {}", e);
                return;
            }
        };

        let mut conn = match get_connection(&self.pool).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to get Redis connection for publish: {}", e);
                return;
            }
        };

        for scope in scopes {
            let key = scope.stream_key();
            let result: redis::RedisResult<String> = conn
                .xadd_maxlen(&key, StreamMaxlen::Approx(self.maxlen), "*", &[(STREAM_FIELD, payload.as_str())])
                .await;
            match result {
                Ok(entry_id) => tracing::debug!("Published {:?} to {} ({})", event.kind, key, entry_id),
                Err(e) => tracing::warn!("Failed to publish change to {}: {}", key, e),
            }
        }
    }
}
