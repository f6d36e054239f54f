use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Setting up remote store connection pool");
    tracing::info!("Database URL: {}", mask_database_url(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);

    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let attempts = config.connect_attempts.max(1);
    let mut last_error = anyhow!("No connection attempt was made");
    for attempt in 1..=attempts {
        tracing::info!("Connection attempt {} of {}", attempt, attempts);

        match tokio::time::timeout(Duration::from_secs(15), pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Remote store connection established");
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!("Database connection failed on attempt {}: {}", attempt, e);
                last_error = anyhow!("Database connection failed: {}", e);
            }
            Err(_) => {
                tracing::warn!("Database connection timed out on attempt {}", attempt);
                last_error = anyhow!("Database connection timed out");
            }
        }

        if attempt < attempts {
            let wait_time = Duration::from_secs(2_u64.pow((attempt - 1).min(5)));
            tracing::info!("Waiting {:?} before retry...", wait_time);
            tokio::time::sleep(wait_time).await;
        }
    }

    tracing::error!("All {} database connection attempts failed", attempts);
    Err(last_error)
}

/// Hides the password component of a connection URL for logging.
pub fn mask_database_url(url: &str) -> String {
    match url.rfind('@') {
        Some(at_pos) => {
            let (before_at, after_at) = url.split_at(at_pos);
            let scheme_end = before_at.find("://").map(|p| p + 3).unwrap_or(0);
            match before_at[scheme_end..].rfind(':') {
                Some(colon_pos) => {
                    format!("{}:****{}", &before_at[..scheme_end + colon_pos], after_at)
                }
                None => format!("{}****{}", &before_at[..scheme_end], after_at),
            }
        }
        None => url.to_string(),
    }
}
