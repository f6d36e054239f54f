use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    identity_from_token, BackendKind, Config, MemoryBackend, PushTransport, RemoteStore,
    SessionBinding, SyncContext,
};
use sync_messaging::{run as run_messaging, MessagingService};
use sync_notify::{run as run_notify, NotificationService};
use sync_realtime::RedisStreamTransport;
use tokio;
use tracing;
use tracing_subscriber;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

async fn backends(config: &Config) -> Result<(Arc<dyn RemoteStore>, Arc<dyn PushTransport>)> {
    match config.backend {
        BackendKind::Memory => {
            tracing::warn!("Using the in-process backend; nothing is persisted");
            let backend = Arc::new(MemoryBackend::new());
            let store: Arc<dyn RemoteStore> = backend.clone();
            let transport: Arc<dyn PushTransport> = backend;
            Ok((store, transport))
        }
        BackendKind::Postgres => {
            let ctx = SyncContext::new(config.clone()).await?;
            let store: Arc<dyn RemoteStore> = Arc::new(ctx.remote_store());
            let transport: Arc<dyn PushTransport> =
                Arc::new(RedisStreamTransport::new(ctx.redis_pool.clone(), &config.realtime));
            Ok((store, transport))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting marketplace sync runner");

    let config = Config::from_env();
    let (store, transport) = backends(&config).await?;

    let messaging = Arc::new(MessagingService::new(store.clone(), transport.clone(), &config.realtime));
    let notifications = Arc::new(NotificationService::new(store, transport, &config.realtime));

    let session = SessionBinding::new();
    match config.session.token.as_deref() {
        Some(token) => match identity_from_token(token, &config.session.jwt_secret) {
            Ok(identity) => session.bind(identity),
            Err(e) => tracing::error!("SESSION_TOKEN rejected: {}", e),
        },
        None => tracing::warn!("No SESSION_TOKEN set; staying unbound"),
    }

    let retry_every = Duration::from_secs(config.realtime.max_backoff_secs);

    let messaging_task = tokio::spawn({
        let service = messaging.clone();
        let session = session.clone();
        async move {
            if let Err(e) = run_messaging(service, session, retry_every).await {
                tracing::error!("Messaging sync error: {}", e);
            }
        }
    });

    let notify_task = tokio::spawn({
        let service = notifications.clone();
        let session = session.clone();
        async move {
            if let Err(e) = run_notify(service, session, retry_every).await {
                tracing::error!("Notification sync error: {}", e);
            }
        }
    });

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status.tick() => {
                tracing::info!(
                    "threads={} thread_unread={} notifications={} notification_unread={} list={} feed={} degraded={}",
                    messaging.threads().len(),
                    messaging.unread_total(),
                    notifications.notifications().len(),
                    notifications.unread_count(),
                    messaging.list_phase(),
                    notifications.phase(),
                    messaging.realtime_degraded() || notifications.realtime_degraded(),
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down, closing channels");
    messaging_task.abort();
    notify_task.abort();
    messaging.bind(None).await;
    notifications.bind(None).await;

    Ok(())
}
