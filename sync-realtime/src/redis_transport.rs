use async_trait::async_trait;
use redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use sync_core::redis::{get_connection, RedisConnection, RedisPool, STREAM_FIELD};
use sync_core::{
    ChannelError, ChannelSignal, EventSink, PushTransport, RealtimeConfig, ResourceScope, RowEvent,
    SubscriptionHandle,
};
use tokio::task::JoinHandle;
use tracing;

const READ_BATCH: usize = 100;

/// Push transport following one Redis stream per subscription.
pub struct RedisStreamTransport {
    pool: RedisPool,
    block_ms: usize,
    max_backoff_secs: u64,
    next_handle: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl RedisStreamTransport {
    pub fn new(pool: RedisPool, config: &RealtimeConfig) -> Self {
        Self {
            pool,
            block_ms: config.block_ms,
            max_backoff_secs: config.max_backoff_secs.max(1),
            next_handle: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PushTransport for RedisStreamTransport {
    async fn subscribe(&self, scope: &ResourceScope, sink: EventSink) -> Result<SubscriptionHandle, ChannelError> {
        let key = scope.stream_key();
        let mut conn = get_connection(&self.pool)
            .await
            .map_err(|e| ChannelError::Subscribe(format!("{}: {}", key, e)))?;

        // Follow from the current tail so only changes after this point are
        // delivered; the caller's snapshot covers everything before it.
        let start_id = tail_id(&mut conn, &key)
            .await
            .map_err(|e| ChannelError::Subscribe(format!("{}: {}", key, e)))?;

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        tracing::info!("Subscribed to {} from {} ({:?})", key, start_id, handle);
        sink.send(ChannelSignal::Subscribed);

        let task = tokio::spawn(follow_stream(
            self.pool.clone(),
            key,
            start_id,
            sink,
            self.block_ms,
            self.max_backoff_secs,
        ));
        self.tasks().insert(handle.0, task);

        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChannelError> {
        if let Some(task) = self.tasks().remove(&handle.0) {
            task.abort();
            tracing::debug!("Released subscription {:?}", handle);
        }
        Ok(())
    }
}

impl Drop for RedisStreamTransport {
    fn drop(&mut self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}

async fn tail_id(conn: &mut RedisConnection, key: &str) -> redis::RedisResult<String> {
    let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", 1).await?;
    Ok(reply
        .ids
        .first()
        .map(|entry| entry.id.clone())
        .unwrap_or_else(|| "0-0".to_string()))
}

async fn follow_stream(
    pool: RedisPool,
    key: String,
    mut last_id: String,
    sink: EventSink,
    block_ms: usize,
    max_backoff_secs: u64,
) {
    let options = StreamReadOptions::default().block(block_ms).count(READ_BATCH);
    let mut conn: Option<RedisConnection> = None;
    let mut failures: u32 = 0;

    loop {
        if sink.is_closed() {
            tracing::debug!("Receiver for {} is gone, stopping", key);
            return;
        }

        if conn.is_none() {
            if failures > 0 {
                sink.send(ChannelSignal::Reconnecting);
            }
            match get_connection(&pool).await {
                Ok(c) => {
                    if failures > 0 {
                        tracing::info!("Reconnected to {} after {} failures", key, failures);
                        sink.send(ChannelSignal::Subscribed);
                        failures = 0;
                    }
                    conn = Some(c);
                }
                Err(e) => {
                    failures += 1;
                    sink.send(ChannelSignal::Dropped {
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(backoff_delay(failures, max_backoff_secs)).await;
                    continue;
                }
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };

        let result: redis::RedisResult<Option<StreamReadReply>> =
            active.xread_options(&[&key], &[&last_id], &options).await;

        match result {
            Ok(Some(reply)) => {
                for stream in reply.keys {
                    for entry in stream.ids {
                        last_id = entry.id.clone();
                        let Some(payload) = entry.get::<String>(STREAM_FIELD) else {
                            tracing::warn!("Entry {} on {} has no {} field", entry.id, key, STREAM_FIELD);
                            continue;
                        };
                        match decode_event(&payload) {
                            Some(event) => {
                                sink.send(ChannelSignal::Change(event));
                            }
                            None => tracing::warn!("Skipping malformed entry {} on {}", entry.id, key),
                        }
                    }
                }
            }
            // Block interval elapsed without new entries.
            Ok(None) => {}
            Err(e) => {
                failures += 1;
                tracing::warn!("Stream read on {} failed: {}", key, e);
                sink.send(ChannelSignal::Dropped {
                    reason: e.to_string(),
                });
                conn = None;
                tokio::time::sleep(backoff_delay(failures, max_backoff_secs)).await;
            }
        }
    }
}

/// 1s, 2s, 4s... capped at `max_secs`.
pub(crate) fn backoff_delay(failures: u32, max_secs: u64) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    Duration::from_secs((1u64 << exp).min(max_secs.max(1)))
}

pub(crate) fn decode_event(payload: &str) -> Option<RowEvent> {
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::ChangeKind;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(1, 30), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 30), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, 30), Duration::from_secs(8));
        assert_eq!(backoff_delay(9, 30), Duration::from_secs(30));
        assert_eq!(backoff_delay(40, 30), Duration::from_secs(30));
    }

    #[test]
    fn test_decode_published_payload() {
        let event = decode_event(r#"{"kind":"delete","row":{"id":"n1"}}"#).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.row_id().as_deref(), Some("n1"));

        assert!(decode_event("not json").is_none());
        assert!(decode_event(r#"{"kind":"upsert","row":{}}"#).is_none());
    }
}
