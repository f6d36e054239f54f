use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use sync_core::SessionBinding;
use sync_realtime::StreamPhase;
use tracing;

use crate::service::NotificationService;

/// Drives the service: follows identity changes, handles channel signals and
/// periodically retries an errored channel.
pub async fn run(service: Arc<NotificationService>, session: SessionBinding, retry_every: Duration) -> Result<()> {
    tracing::info!("Starting notification sync");

    let mut identities = session.subscribe();
    let initial = identities.borrow_and_update().clone();
    service.bind(initial).await;

    let mut retry = tokio::time::interval(retry_every.max(Duration::from_secs(1)));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = identities.changed() => {
                if changed.is_err() {
                    tracing::info!("Session binding dropped, stopping notification sync");
                    break;
                }
                let identity = identities.borrow_and_update().clone();
                service.bind(identity).await;
            }
            signal = service.next_signal() => {
                match signal {
                    Some(signal) => service.handle_signal(signal).await,
                    None => break,
                }
            }
            _ = retry.tick() => {
                if service.phase() == StreamPhase::Errored && service.reconnect().await {
                    tracing::info!("Retrying notification channel");
                }
            }
        }
    }

    Ok(())
}
