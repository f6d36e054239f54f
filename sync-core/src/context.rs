use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool as create_db_pool, DbPool};
use crate::pg_store::PgRemoteStore;
use crate::redis::{create_pool as create_redis_pool, ChangePublisher, RedisPool};

/// Connections shared by the Postgres-backed store and the Redis push
/// transport.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
}

impl SyncContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;

        Ok(SyncContext {
            config: Arc::new(config),
            db_pool,
            redis_pool,
        })
    }

    /// Store whose writes are announced on the scope streams.
    pub fn remote_store(&self) -> PgRemoteStore {
        let publisher = ChangePublisher::new(self.redis_pool.clone(), &self.config.redis);
        PgRemoteStore::new(self.db_pool.clone(), Some(publisher))
    }
}
