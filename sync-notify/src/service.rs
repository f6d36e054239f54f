use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sync_core::{
    ChangeKind, Identity, Notification, NotificationId, PushTransport, ReadTarget, RealtimeConfig,
    RemoteStore, ResourceScope, RowEvent, ScopedSignal, SyncError,
};
use sync_realtime::{StreamAction, StreamPhase, StreamRegistry};
use tracing;

use crate::feed::NotificationFeed;

/// Key of the one channel this service keeps: the bound identity's feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FeedChannel;

#[derive(Default)]
struct FeedState {
    identity: Option<Identity>,
    feed: NotificationFeed,
}

/// Notification feed of the bound identity kept in sync with the remote
/// store.
///
/// All local mutation goes through this type; callers only get copies.
pub struct NotificationService {
    store: Arc<dyn RemoteStore>,
    channels: StreamRegistry<FeedChannel>,
    state: RwLock<FeedState>,
    /// Bumped on every identity change; fetches started under an older epoch
    /// are discarded.
    epoch: AtomicU64,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        transport: Arc<dyn PushTransport>,
        realtime: &RealtimeConfig,
    ) -> Self {
        Self {
            store,
            channels: StreamRegistry::new(transport, realtime.degraded_after),
            state: RwLock::new(FeedState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FeedState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FeedState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_identity(&self) -> Result<Identity, SyncError> {
        self.read().identity.clone().ok_or(SyncError::Auth)
    }

    /// Reacts to an identity transition: closes the old feed channel, resets
    /// local state, then opens the new channel and loads the snapshot.
    pub async fn bind(&self, identity: Option<Identity>) {
        if self.read().identity == identity {
            return;
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.write();
            state.feed = NotificationFeed::new(identity.as_ref().map(|i| i.id.clone()));
            state.identity = identity.clone();
        }
        self.channels.close(&FeedChannel).await;

        let Some(identity) = identity else {
            tracing::info!("Notification feed unbound");
            return;
        };

        tracing::info!("Binding notification feed to {}", identity.id);
        self.channels
            .open(FeedChannel, ResourceScope::notifications_for(&identity.id))
            .await;

        if let Err(e) = self.refresh().await {
            tracing::warn!("Initial notification snapshot failed: {}", e);
        }
    }

    /// Re-fetches the feed. On failure the current items stay untouched.
    /// Pushes applied while the fetch was in flight win over the snapshot.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let identity = self.require_identity()?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let since = self.read().feed.revision();

        let rows = match self.store.fetch_notifications(&identity).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to fetch notifications for {}: {}", identity.id, e);
                return Err(SyncError::Fetch(e));
            }
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("Discarding notification snapshot for {}", identity.id);
            return Ok(0);
        }

        let count = rows.len();
        if !self.write().feed.merge_snapshot(rows, since) {
            return Ok(0);
        }
        tracing::debug!("Loaded {} notifications for {}", count, identity.id);
        Ok(count)
    }

    /// Flips every unread notification locally, then confirms remotely. A
    /// remote failure puts back exactly the items this call flipped.
    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let flipped = self.write().feed.mark_all_read();
        if flipped.is_empty() {
            return Ok(());
        }

        if let Err(e) = self
            .store
            .mark_read(&identity, &ReadTarget::AllNotifications)
            .await
        {
            tracing::error!("Failed to mark notifications read for {}: {}", identity.id, e);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                self.write().feed.restore_unread(&flipped);
            }
            return Err(SyncError::Remote(e));
        }

        tracing::debug!("Marked {} notifications read", flipped.len());
        Ok(())
    }

    /// Marks one notification read. No-op when it is unknown or already read.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        let epoch = self.epoch.load(Ordering::SeqCst);

        if !self.write().feed.mark_read(id) {
            return Ok(());
        }

        if let Err(e) = self
            .store
            .mark_read(&identity, &ReadTarget::Notification(id.clone()))
            .await
        {
            tracing::error!("Failed to mark notification {} read: {}", id, e);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                self.write().feed.mark_unread(id);
            }
            return Err(SyncError::Remote(e));
        }
        Ok(())
    }

    /// Deletes remotely. The item leaves the local feed when the delete event
    /// comes back over the channel.
    pub async fn delete(&self, id: &NotificationId) -> Result<(), SyncError> {
        let identity = self.require_identity()?;

        self.store
            .delete_notification(&identity, id)
            .await
            .map_err(|e| {
                tracing::error!("Failed to delete notification {}: {}", id, e);
                SyncError::Remote(e)
            })
    }

    pub async fn handle_signal(&self, signal: ScopedSignal) {
        let Some((_, actions)) = self.channels.route(signal) else {
            return;
        };

        for action in actions {
            match action {
                StreamAction::Opened { resync: true } => {
                    tracing::info!("Notification channel recovered, re-fetching feed");
                    if let Err(e) = self.refresh().await {
                        tracing::warn!("Compensating notification fetch failed: {}", e);
                    }
                }
                StreamAction::Opened { resync: false } => {}
                StreamAction::Deliver(event) => self.apply(event),
                StreamAction::Dropped { degraded } => {
                    if degraded {
                        tracing::warn!("Realtime notifications degraded");
                    }
                }
            }
        }
    }

    fn apply(&self, event: RowEvent) {
        let mut state = self.write();
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => match Notification::from_row(&event.row) {
                Some(notification) => {
                    state.feed.upsert(notification);
                }
                None => tracing::warn!("Skipping notification row without id: {}", event.row),
            },
            ChangeKind::Delete => match event.row_id() {
                Some(id) => {
                    state.feed.remove(&NotificationId(id));
                }
                None => tracing::warn!("Skipping delete without id: {}", event.row),
            },
        }
    }

    /// Handles every queued signal without waiting. Returns how many were
    /// handled.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        while let Some(signal) = self.channels.try_next() {
            self.handle_signal(signal).await;
            handled += 1;
        }
        handled
    }

    pub async fn next_signal(&self) -> Option<ScopedSignal> {
        self.channels.next_signal().await
    }

    /// Replaces an errored feed channel. Returns true when a new attempt was
    /// started.
    pub async fn reconnect(&self) -> bool {
        self.channels.reopen_errored().await > 0
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().identity.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.read().feed.items().to_vec()
    }

    pub fn notification(&self, id: &NotificationId) -> Option<Notification> {
        self.read().feed.get(id).cloned()
    }

    pub fn unread_count(&self) -> usize {
        self.read().feed.unread_count()
    }

    pub fn recompute_unread(&self) -> usize {
        self.read().feed.recompute_unread()
    }

    pub fn phase(&self) -> StreamPhase {
        self.channels.phase(&FeedChannel)
    }

    pub fn realtime_degraded(&self) -> bool {
        self.channels.is_degraded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use sync_core::{
        ChannelSignal, MemoryBackend, Message, NewMessage, NewThread, NotificationType, RemoteError,
        Role, Thread, ThreadId, UserId,
    };
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    fn service(backend: &Arc<MemoryBackend>) -> NotificationService {
        NotificationService::new(backend.clone(), backend.clone(), &RealtimeConfig::default())
    }

    fn client() -> Identity {
        Identity::new("u1", Role::Client)
    }

    fn note(id: &str, minutes_ago: i64) -> Notification {
        Notification {
            id: NotificationId::from(id),
            recipient_id: UserId::from("u1"),
            kind: NotificationType::BookingAccepted,
            title: "Booking accepted".into(),
            body: "Pat accepted your request".into(),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            is_read: false,
            booking_id: Some("b1".into()),
            thread_id: None,
        }
    }

    fn assert_consistent(svc: &NotificationService) {
        assert_eq!(svc.unread_count(), svc.recompute_unread());
    }

    #[tokio::test]
    async fn test_bind_loads_snapshot_and_opens_channel() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_notification(note("n1", 5));
        backend.seed_notification(note("n2", 1));
        let svc = service(&backend);

        svc.bind(Some(client())).await;
        svc.pump().await;

        assert_eq!(svc.phase(), StreamPhase::Open);
        assert_eq!(svc.notifications()[0].id.as_str(), "n2");
        assert_eq!(svc.unread_count(), 2);
        assert_eq!(
            backend.open_subscriptions(&ResourceScope::notifications_for(&UserId::from("u1"))),
            1
        );

        // Rebinding the same identity keeps the single channel.
        svc.bind(Some(client())).await;
        assert_eq!(backend.total_open_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_unbind_closes_and_clears() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_notification(note("n1", 5));
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        svc.bind(None).await;
        svc.bind(None).await;
        assert_eq!(svc.phase(), StreamPhase::Closed);
        assert!(svc.notifications().is_empty());
        assert_eq!(backend.total_open_subscriptions(), 0);
        assert_eq!(svc.mark_all_read().await, Err(SyncError::Auth));
    }

    #[tokio::test]
    async fn test_push_events_flow_into_feed() {
        let backend = Arc::new(MemoryBackend::new());
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.pump().await;

        backend.publish_notification(note("n1", 0));
        backend.publish_notification(note("n1", 0));
        svc.pump().await;
        assert_eq!(svc.notifications().len(), 1);
        assert_eq!(svc.unread_count(), 1);

        let mut other = note("x", 0);
        other.recipient_id = UserId::from("u2");
        backend.publish_notification(other);
        svc.pump().await;
        assert_eq!(svc.notifications().len(), 1);
        assert_consistent(&svc);
    }

    #[tokio::test]
    async fn test_structured_payload_is_normalized_on_ingest() {
        let backend = Arc::new(MemoryBackend::new());
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        let scope = ResourceScope::notifications_for(&UserId::from("u1"));
        backend.emit_raw(
            &scope,
            RowEvent {
                kind: ChangeKind::Insert,
                row: serde_json::json!({
                    "id": "n1",
                    "user_id": "u1",
                    "type": "payment_received",
                    "title": {"text": "Payment received"},
                    "message": {"amount": 80},
                    "created_at": "2026-10-01T09:00:00Z",
                    "is_read": 0,
                }),
            },
        );
        backend.emit_raw(
            &scope,
            RowEvent {
                kind: ChangeKind::Insert,
                row: serde_json::json!({"title": "no id"}),
            },
        );
        svc.pump().await;

        let items = svc.notifications();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Payment received");
        assert_eq!(items[0].body, r#"{"amount":80}"#);
        assert_eq!(svc.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read_success_and_noop() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..3 {
            backend.seed_notification(note(&format!("n{}", i), i));
        }
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        svc.mark_all_read().await.unwrap();
        assert_eq!(svc.unread_count(), 0);
        assert_eq!(backend.stored_unread_notifications(&UserId::from("u1")), 0);

        // The echoed updates change nothing.
        svc.pump().await;
        assert_eq!(svc.unread_count(), 0);

        let writes = backend.write_count();
        svc.mark_all_read().await.unwrap();
        assert_eq!(backend.write_count(), writes);
        assert_consistent(&svc);
    }

    #[tokio::test]
    async fn test_mark_all_read_rolls_back_on_failure() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..5 {
            backend.seed_notification(note(&format!("n{}", i), i));
        }
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        assert_eq!(svc.unread_count(), 5);

        backend.fail_next_writes(1);
        let result = svc.mark_all_read().await;
        assert!(matches!(result, Err(SyncError::Remote(_))));
        assert_eq!(svc.unread_count(), 5);
        assert!(svc.notifications().iter().all(|n| !n.is_read));
        assert_consistent(&svc);
    }

    /// Store that parks `mark_read` until released, so the optimistic state
    /// can be observed mid-flight.
    struct GatedStore {
        inner: Arc<MemoryBackend>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
            self.inner.fetch_threads(identity).await
        }

        async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError> {
            self.inner.fetch_messages(thread_id).await
        }

        async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>, RemoteError> {
            self.inner.fetch_notifications(identity).await
        }

        async fn create_thread(&self, pair: &NewThread) -> Result<Thread, RemoteError> {
            self.inner.create_thread(pair).await
        }

        async fn insert_message(&self, draft: &NewMessage) -> Result<Message, RemoteError> {
            self.inner.insert_message(draft).await
        }

        async fn mark_read(&self, identity: &Identity, target: &ReadTarget) -> Result<(), RemoteError> {
            self.gate.notified().await;
            self.inner.mark_read(identity, target).await
        }

        async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
            self.inner.delete_notification(identity, id).await
        }
    }

    #[tokio::test]
    async fn test_mark_all_read_is_one_local_step_then_rollback() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..5 {
            backend.seed_notification(note(&format!("n{}", i), i));
        }
        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            inner: backend.clone(),
            gate: gate.clone(),
        });
        let svc = Arc::new(NotificationService::new(
            store,
            backend.clone(),
            &RealtimeConfig::default(),
        ));
        svc.bind(Some(client())).await;
        assert_eq!(svc.unread_count(), 5);

        backend.fail_next_writes(1);
        let pending = tokio::spawn({
            let svc = svc.clone();
            async move { svc.mark_all_read().await }
        });

        while svc.unread_count() != 0 {
            tokio::task::yield_now().await;
        }
        assert!(svc.notifications().iter().all(|n| n.is_read));

        gate.notify_one();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SyncError::Remote(_))));
        assert_eq!(svc.unread_count(), 5);
        assert!(svc.notifications().iter().all(|n| !n.is_read));
    }

    #[tokio::test]
    async fn test_mark_single_read() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_notification(note("n1", 2));
        backend.seed_notification(note("n2", 1));
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        svc.mark_read(&NotificationId::from("n1")).await.unwrap();
        assert_eq!(svc.unread_count(), 1);

        backend.fail_next_writes(1);
        assert!(svc.mark_read(&NotificationId::from("n2")).await.is_err());
        assert_eq!(svc.unread_count(), 1);
        assert!(!svc.notification(&NotificationId::from("n2")).unwrap().is_read);

        // Already read: no remote call.
        let writes = backend.write_count();
        svc.mark_read(&NotificationId::from("n1")).await.unwrap();
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_delete_is_applied_by_push_only() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_notification(note("n1", 2));
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.pump().await;

        svc.delete(&NotificationId::from("n1")).await.unwrap();
        assert_eq!(svc.notifications().len(), 1);

        svc.pump().await;
        assert!(svc.notifications().is_empty());
        assert_eq!(svc.unread_count(), 0);

        // Deleting an unknown id is harmless.
        svc.delete(&NotificationId::from("n1")).await.unwrap();
        svc.pump().await;
        assert!(svc.notifications().is_empty());
    }

    /// Store whose notification fetch, once armed, reads its rows and then
    /// waits for release before returning them.
    struct LateSnapshotStore {
        inner: Arc<MemoryBackend>,
        armed: AtomicBool,
        parked: AtomicBool,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RemoteStore for LateSnapshotStore {
        async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
            self.inner.fetch_threads(identity).await
        }

        async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError> {
            self.inner.fetch_messages(thread_id).await
        }

        async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>, RemoteError> {
            let rows = self.inner.fetch_notifications(identity).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.store(true, Ordering::SeqCst);
                self.gate.notified().await;
            }
            rows
        }

        async fn create_thread(&self, pair: &NewThread) -> Result<Thread, RemoteError> {
            self.inner.create_thread(pair).await
        }

        async fn insert_message(&self, draft: &NewMessage) -> Result<Message, RemoteError> {
            self.inner.insert_message(draft).await
        }

        async fn mark_read(&self, identity: &Identity, target: &ReadTarget) -> Result<(), RemoteError> {
            self.inner.mark_read(identity, target).await
        }

        async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
            self.inner.delete_notification(identity, id).await
        }
    }

    #[tokio::test]
    async fn test_pushes_during_refresh_survive_the_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_notification(note("old", 10));
        let gate = Arc::new(Notify::new());
        let store = Arc::new(LateSnapshotStore {
            inner: backend.clone(),
            armed: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            gate: gate.clone(),
        });
        let svc = Arc::new(NotificationService::new(
            store.clone(),
            backend.clone(),
            &RealtimeConfig::default(),
        ));
        svc.bind(Some(client())).await;
        svc.pump().await;
        assert_eq!(svc.unread_count(), 1);

        store.armed.store(true, Ordering::SeqCst);
        let refreshing = tokio::spawn({
            let svc = svc.clone();
            async move { svc.refresh().await }
        });
        while !store.parked.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        backend.publish_notification(note("n1", 0));
        svc.delete(&NotificationId::from("old")).await.unwrap();
        svc.pump().await;
        assert_eq!(svc.unread_count(), 1);

        gate.notify_one();
        refreshing.await.unwrap().unwrap();

        let items = svc.notifications();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_str(), "n1");
        assert_eq!(svc.unread_count(), 1);
        assert_consistent(&svc);
    }

    #[tokio::test]
    async fn test_drop_then_recovery_refetches() {
        let backend = Arc::new(MemoryBackend::new());
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.pump().await;

        let scope = ResourceScope::notifications_for(&UserId::from("u1"));
        backend.drop_channels(&scope, "connection reset");
        svc.pump().await;
        assert_eq!(svc.phase(), StreamPhase::Errored);

        // Written while the channel was down; only a re-fetch can see it.
        backend.seed_notification(note("missed", 0));
        backend.recover_channels(&scope);
        svc.pump().await;

        assert_eq!(svc.phase(), StreamPhase::Open);
        assert_eq!(svc.notifications().len(), 1);
        assert_eq!(svc.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_surface_degraded_flag() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_subscribes(3);
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        assert_eq!(svc.phase(), StreamPhase::Errored);
        assert!(!svc.realtime_degraded());

        assert!(svc.reconnect().await);
        assert!(svc.reconnect().await);
        assert!(svc.realtime_degraded());

        assert!(svc.reconnect().await);
        svc.pump().await;
        assert_eq!(svc.phase(), StreamPhase::Open);
        assert!(!svc.realtime_degraded());
        assert!(!svc.reconnect().await);
    }

    #[tokio::test]
    async fn test_late_signal_from_previous_identity_is_discarded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.hold_acks(true);
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        let old_scope = ResourceScope::notifications_for(&UserId::from("u1"));
        let stale = backend.sinks_for(&old_scope).remove(0);

        svc.bind(Some(Identity::new("u2", Role::Client))).await;
        stale.send(ChannelSignal::Subscribed);
        stale.send(ChannelSignal::Change(RowEvent::insert(&note("n1", 0))));
        svc.pump().await;

        assert!(svc.notifications().is_empty());
        assert_eq!(svc.phase(), StreamPhase::Opening);
    }
}
