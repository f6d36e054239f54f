use chrono::{SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sync_core::{
    ChangeKind, Identity, Message, MessageId, NewMessage, NewThread, PushTransport, ReadTarget,
    RealtimeConfig, RemoteStore, ResourceScope, RowEvent, ScopedSignal, SyncError, Thread, ThreadId,
    UserId,
};
use sync_realtime::{StreamAction, StreamPhase, StreamRegistry};
use tracing;
use uuid::Uuid;

use crate::messages::{MessageEntry, MessageLog};
use crate::threads::ThreadList;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Channel {
    ThreadList,
    Thread(ThreadId),
}

#[derive(Default)]
struct MessagingState {
    identity: Option<Identity>,
    threads: ThreadList,
    /// Only threads that are currently open have a log.
    logs: HashMap<ThreadId, MessageLog>,
    active: Option<ThreadId>,
}

/// Thread list and open conversations of the bound identity.
pub struct MessagingService {
    store: Arc<dyn RemoteStore>,
    channels: StreamRegistry<Channel>,
    state: RwLock<MessagingState>,
    epoch: AtomicU64,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        transport: Arc<dyn PushTransport>,
        realtime: &RealtimeConfig,
    ) -> Self {
        Self {
            store,
            channels: StreamRegistry::new(transport, realtime.degraded_after),
            state: RwLock::new(MessagingState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MessagingState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MessagingState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_identity(&self) -> Result<Identity, SyncError> {
        self.read().identity.clone().ok_or(SyncError::Auth)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn bind(&self, identity: Option<Identity>) {
        if self.read().identity == identity {
            return;
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.write();
            state.threads = ThreadList::new(identity.clone());
            state.logs.clear();
            state.active = None;
            state.identity = identity.clone();
        }
        self.channels.close_all().await;

        let Some(identity) = identity else {
            tracing::info!("Messaging unbound");
            return;
        };

        tracing::info!("Binding messaging to {} ({})", identity.id, identity.role);
        self.channels
            .open(Channel::ThreadList, ResourceScope::threads_of(&identity.id))
            .await;

        if let Err(e) = self.refresh_threads().await {
            tracing::warn!("Initial thread snapshot failed: {}", e);
        }
    }

    /// Re-fetches the thread list. On failure the current list stays. Pushes
    /// applied while the fetch was in flight win over the snapshot.
    pub async fn refresh_threads(&self) -> Result<usize, SyncError> {
        let identity = self.require_identity()?;
        let epoch = self.current_epoch();
        let since = self.read().threads.revision();

        let rows = match self.store.fetch_threads(&identity).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to fetch threads for {}: {}", identity.id, e);
                return Err(SyncError::Fetch(e));
            }
        };

        if self.current_epoch() != epoch {
            tracing::debug!("Discarding thread snapshot for {}", identity.id);
            return Ok(0);
        }

        let count = rows.len();
        if !self.write().threads.merge_snapshot(rows, since) {
            return Ok(0);
        }
        tracing::debug!("Loaded {} threads for {}", count, identity.id);
        Ok(count)
    }

    /// Re-fetches the messages of an open thread. A fetch that completes
    /// after the thread was closed or reopened is discarded.
    pub async fn refresh_messages(&self, thread_id: &ThreadId) -> Result<usize, SyncError> {
        self.require_identity()?;
        let key = Channel::Thread(thread_id.clone());
        let Some(token) = self.channels.token(&key) else {
            return Ok(0);
        };

        let rows = match self.store.fetch_messages(thread_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to fetch messages of {}: {}", thread_id, e);
                return Err(SyncError::Fetch(e));
            }
        };

        if self.channels.token(&key) != Some(token) {
            tracing::debug!("Discarding message snapshot of {} from {}", thread_id, token);
            return Ok(0);
        }

        let count = rows.len();
        let mut state = self.write();
        match state.logs.get_mut(thread_id) {
            Some(log) => log.merge_snapshot(rows),
            None => return Ok(0),
        }
        tracing::debug!("Loaded {} messages of {}", count, thread_id);
        Ok(count)
    }

    /// Starts following a thread. Opening a thread that is already open does
    /// nothing.
    pub async fn open_thread(&self, thread_id: &ThreadId) -> Result<(), SyncError> {
        self.require_identity()?;
        self.write()
            .logs
            .entry(thread_id.clone())
            .or_insert_with(|| MessageLog::new(thread_id.clone()));

        let opened = self
            .channels
            .open(Channel::Thread(thread_id.clone()), ResourceScope::messages_in(thread_id))
            .await;
        if opened.is_none() {
            return Ok(());
        }

        if let Err(e) = self.refresh_messages(thread_id).await {
            tracing::warn!("Initial message snapshot of {} failed: {}", thread_id, e);
        }
        Ok(())
    }

    /// Stops following a thread and drops its loaded messages. Idempotent.
    pub async fn close_thread(&self, thread_id: &ThreadId) {
        {
            let mut state = self.write();
            state.logs.remove(thread_id);
            if state.active.as_ref() == Some(thread_id) {
                state.active = None;
            }
        }
        self.channels.close(&Channel::Thread(thread_id.clone())).await;
    }

    /// Switches the active thread: the previous one is closed before the new
    /// one is opened.
    pub async fn set_active_thread(&self, thread_id: Option<ThreadId>) -> Result<(), SyncError> {
        self.require_identity()?;
        let previous = {
            let mut state = self.write();
            if state.active == thread_id {
                return Ok(());
            }
            std::mem::replace(&mut state.active, thread_id.clone())
        };

        if let Some(previous) = previous {
            self.close_thread(&previous).await;
        }
        match thread_id {
            Some(thread_id) => self.open_thread(&thread_id).await,
            None => Ok(()),
        }
    }

    /// Returns the thread with `other`, creating it if there is none. The
    /// store decides uniqueness of the pair.
    pub async fn get_or_create_thread(&self, other: &UserId) -> Result<Thread, SyncError> {
        let identity = self.require_identity()?;
        if other == &identity.id {
            return Err(SyncError::Validation("cannot start a thread with yourself".to_string()));
        }
        let epoch = self.current_epoch();

        let pair = NewThread::between(&identity, other);
        let thread = self.store.create_thread(&pair).await.map_err(|e| {
            tracing::error!("Failed to get or create thread with {}: {}", other, e);
            SyncError::Remote(e)
        })?;

        if self.current_epoch() == epoch {
            self.write().threads.upsert(thread.clone());
        }
        Ok(thread)
    }

    /// Sends a message. While the send is in flight the thread's log shows a
    /// pending entry, which the confirmed row replaces in place.
    pub async fn send_message(
        &self,
        thread_id: &ThreadId,
        body: &str,
        attachment_url: Option<&str>,
    ) -> Result<Message, SyncError> {
        let body = body.trim();
        let attachment_url = attachment_url.map(str::trim).filter(|url| !url.is_empty());
        if body.is_empty() && attachment_url.is_none() {
            return Err(SyncError::Validation(
                "a message needs a body or an attachment".to_string(),
            ));
        }

        let identity = self.require_identity()?;
        let epoch = self.current_epoch();
        let draft = NewMessage {
            thread_id: thread_id.clone(),
            sender_id: identity.id.clone(),
            sender_role: identity.role,
            body: (!body.is_empty()).then(|| body.to_string()),
            attachment_url: attachment_url.map(str::to_string),
            created_at: Utc::now().trunc_subsecs(6),
        };

        let local_id = MessageId::new(format!("local-{}", Uuid::new_v4()));
        if let Some(log) = self.write().logs.get_mut(thread_id) {
            log.push_pending(draft.to_message(local_id.clone()));
        }

        match self.store.insert_message(&draft).await {
            Ok(message) => {
                if self.current_epoch() == epoch {
                    self.confirm_sent(&local_id, message.clone());
                }
                Ok(message)
            }
            Err(e) => {
                tracing::error!("Failed to send message to {}: {}", thread_id, e);
                if let Some(log) = self.write().logs.get_mut(thread_id) {
                    log.discard_pending(&local_id);
                }
                Err(SyncError::Remote(e))
            }
        }
    }

    /// Marks everything in the thread read for the bound identity's role.
    /// No remote call when nothing is unread; a failed call is rolled back.
    pub async fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<(), SyncError> {
        let identity = self.require_identity()?;
        let epoch = self.current_epoch();

        let (previous, flipped) = {
            let mut state = self.write();
            let previous = state
                .threads
                .get(thread_id)
                .map(|t| t.unread_for(identity.role))
                .unwrap_or(0);
            let flipped = state
                .logs
                .get_mut(thread_id)
                .map(|log| log.mark_read_by(identity.role, &identity.id))
                .unwrap_or_default();
            if previous == 0 && flipped.is_empty() {
                return Ok(());
            }
            state.threads.set_unread(thread_id, 0);
            (previous, flipped)
        };

        if let Err(e) = self
            .store
            .mark_read(&identity, &ReadTarget::Thread(thread_id.clone()))
            .await
        {
            tracing::error!("Failed to mark thread {} read: {}", thread_id, e);
            if self.current_epoch() == epoch {
                let mut state = self.write();
                state.threads.set_unread(thread_id, previous);
                if let Some(log) = state.logs.get_mut(thread_id) {
                    log.restore_unread(identity.role, &flipped);
                }
            }
            return Err(SyncError::Remote(e));
        }
        Ok(())
    }

    pub async fn handle_signal(&self, signal: ScopedSignal) {
        let Some((channel, actions)) = self.channels.route(signal) else {
            return;
        };

        for action in actions {
            match (action, &channel) {
                (StreamAction::Opened { resync: true }, Channel::ThreadList) => {
                    tracing::info!("Thread channel recovered, re-fetching threads");
                    if let Err(e) = self.refresh_threads().await {
                        tracing::warn!("Compensating thread fetch failed: {}", e);
                    }
                }
                (StreamAction::Opened { resync: true }, Channel::Thread(thread_id)) => {
                    tracing::info!("Channel of {} recovered, re-fetching messages", thread_id);
                    if let Err(e) = self.refresh_messages(thread_id).await {
                        tracing::warn!("Compensating message fetch failed: {}", e);
                    }
                }
                (StreamAction::Opened { resync: false }, _) => {}
                (StreamAction::Deliver(event), Channel::ThreadList) => self.apply_thread_event(event),
                (StreamAction::Deliver(event), Channel::Thread(thread_id)) => {
                    self.apply_message_event(thread_id, event)
                }
                (StreamAction::Dropped { degraded }, channel) => {
                    if degraded {
                        tracing::warn!("Realtime messaging degraded on {:?}", channel);
                    }
                }
            }
        }
    }

    fn apply_thread_event(&self, event: RowEvent) {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                match serde_json::from_value::<Thread>(event.row) {
                    Ok(thread) => {
                        self.write().threads.upsert(thread);
                    }
                    Err(e) => tracing::warn!("Skipping malformed thread row: {}", e),
                }
            }
            ChangeKind::Delete => match event.row_id() {
                Some(id) => {
                    self.write().threads.remove(&ThreadId(id));
                }
                None => tracing::warn!("Skipping thread delete without id"),
            },
        }
    }

    fn apply_message_event(&self, thread_id: &ThreadId, event: RowEvent) {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                match serde_json::from_value::<Message>(event.row) {
                    Ok(message) if &message.thread_id == thread_id => self.apply_message(message),
                    Ok(message) => tracing::warn!(
                        "Message {} for {} arrived on the channel of {}",
                        message.id,
                        message.thread_id,
                        thread_id
                    ),
                    Err(e) => tracing::warn!("Skipping malformed message row: {}", e),
                }
            }
            ChangeKind::Delete => {
                if let Some(id) = event.row_id() {
                    if let Some(log) = self.write().logs.get_mut(thread_id) {
                        log.remove(&MessageId(id));
                    }
                }
            }
        }
    }

    /// Swaps the pending entry for the row the store returned. The push echo
    /// of the same row then finds it by id.
    fn confirm_sent(&self, local_id: &MessageId, message: Message) {
        let mut state = self.write();
        let is_new = match state.logs.get_mut(&message.thread_id) {
            Some(log) => log.confirm(local_id, message.clone()).is_new(),
            None => true,
        };
        if is_new {
            state.threads.touch(&message);
        }
    }

    /// The path by which a pushed or fetched message enters local state.
    fn apply_message(&self, message: Message) {
        let mut state = self.write();
        let is_new = match state.logs.get_mut(&message.thread_id) {
            Some(log) => log.apply(message.clone()).is_new(),
            None => true,
        };
        if is_new {
            state.threads.touch(&message);
        }
    }

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

    /// Replaces every errored channel. Returns how many were reopened.
    pub async fn reconnect(&self) -> usize {
        self.channels.reopen_errored().await
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().identity.clone()
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.read().threads.items().to_vec()
    }

    pub fn thread(&self, id: &ThreadId) -> Option<Thread> {
        self.read().threads.get(id).cloned()
    }

    /// Messages of an open thread, oldest first.
    pub fn messages(&self, thread_id: &ThreadId) -> Option<Vec<Message>> {
        self.read().logs.get(thread_id).map(MessageLog::messages)
    }

    pub fn message_entries(&self, thread_id: &ThreadId) -> Option<Vec<MessageEntry>> {
        self.read()
            .logs
            .get(thread_id)
            .map(|log| log.entries().to_vec())
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.read().active.clone()
    }

    pub fn open_threads(&self) -> Vec<ThreadId> {
        let mut open: Vec<ThreadId> = self.read().logs.keys().cloned().collect();
        open.sort();
        open
    }

    pub fn unread_total(&self) -> u32 {
        self.read().threads.unread_total()
    }

    pub fn recompute_unread(&self) -> u32 {
        self.read().threads.recompute_unread()
    }

    pub fn list_phase(&self) -> StreamPhase {
        self.channels.phase(&Channel::ThreadList)
    }

    pub fn thread_phase(&self, thread_id: &ThreadId) -> StreamPhase {
        self.channels.phase(&Channel::Thread(thread_id.clone()))
    }

    pub fn realtime_degraded(&self) -> bool {
        self.channels.is_degraded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use sync_core::{
        ChannelSignal, MemoryBackend, Notification, NotificationId, NotificationType, RemoteError,
        Role,
    };
    use std::sync::atomic::AtomicBool;
    use sync_notify::NotificationService;
    use tokio::sync::Notify;

    fn service(backend: &Arc<MemoryBackend>) -> MessagingService {
        MessagingService::new(backend.clone(), backend.clone(), &RealtimeConfig::default())
    }

    fn client() -> Identity {
        Identity::new("u1", Role::Client)
    }

    fn thread(id: &str, provider: &str, last_activity_at: DateTime<Utc>) -> Thread {
        Thread {
            id: ThreadId::from(id),
            client_id: UserId::from("u1"),
            provider_id: UserId::from(provider),
            client_name: "Sam Client".into(),
            provider_name: "Pat Plumbing".into(),
            last_message_preview: None,
            last_activity_at,
            client_unread_count: 0,
            provider_unread_count: 0,
        }
    }

    fn provider_message(id: &str, thread_id: &str, created_at: DateTime<Utc>, body: &str) -> Message {
        Message {
            id: MessageId::from(id),
            thread_id: ThreadId::from(thread_id),
            sender_id: UserId::from("p1"),
            sender_role: Role::Provider,
            body: Some(body.into()),
            attachment_url: None,
            created_at,
            read_by_client: false,
            read_by_provider: true,
        }
    }

    fn assert_consistent(svc: &MessagingService) {
        assert_eq!(svc.unread_total(), svc.recompute_unread());
    }

    #[tokio::test]
    async fn test_bind_loads_threads_latest_first() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        backend.seed_thread(thread("t1", "p1", now - Duration::hours(2)));
        backend.seed_thread(thread("t2", "p2", now));
        let mut foreign = thread("t3", "p1", now);
        foreign.client_id = UserId::from("u9");
        backend.seed_thread(foreign);

        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.pump().await;

        let ids: Vec<_> = svc.threads().iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, ["t2", "t1"]);
        assert_eq!(svc.list_phase(), StreamPhase::Open);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_last_known_threads() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_thread(thread("t1", "p1", Utc::now()));
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        backend.fail_next_fetches(1);
        assert!(matches!(svc.refresh_threads().await, Err(SyncError::Fetch(_))));
        assert_eq!(svc.threads().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_without_identity_are_auth_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let svc = service(&backend);
        let t1 = ThreadId::from("t1");

        assert_eq!(svc.send_message(&t1, "hello", None).await, Err(SyncError::Auth));
        assert_eq!(svc.get_or_create_thread(&UserId::from("p1")).await, Err(SyncError::Auth));
        assert_eq!(svc.mark_thread_read(&t1).await, Err(SyncError::Auth));
        assert_eq!(svc.open_thread(&t1).await, Err(SyncError::Auth));
    }

    #[tokio::test]
    async fn test_empty_message_is_validation_error() {
        let backend = Arc::new(MemoryBackend::new());
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        let result = svc.send_message(&ThreadId::from("t1"), "   ", Some(" ")).await;
        assert!(result.unwrap_err().is_validation());
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_under_concurrency() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_profile("p1", "Pat Plumbing");
        let first = service(&backend);
        let second = service(&backend);
        first.bind(Some(client())).await;
        second.bind(Some(client())).await;

        let p1 = UserId::from("p1");
        let (a, b) = tokio::join!(first.get_or_create_thread(&p1), second.get_or_create_thread(&p1));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(a.provider_name, "Pat Plumbing");
        assert_eq!(backend.thread_count(), 1);

        first.pump().await;
        assert_eq!(first.threads().len(), 1);

        // From the provider side the same pair resolves to the same thread.
        let provider = service(&backend);
        provider.bind(Some(Identity::new("p1", Role::Provider))).await;
        let c = provider.get_or_create_thread(&UserId::from("u1")).await.unwrap();
        assert_eq!(c.id, a.id);
    }

    #[tokio::test]
    async fn test_optimistic_send_is_replaced_in_place() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        let start = Utc::now() - Duration::minutes(30);
        backend.seed_thread(thread("t1", "p1", start));
        backend.seed_message(provider_message("m0", "t1", start, "When works for you?"));

        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.open_thread(&t1).await.unwrap();
        svc.pump().await;
        assert_eq!(svc.thread_phase(&t1), StreamPhase::Open);

        let sent = svc.send_message(&t1, " Tuesday at 10 ", None).await.unwrap();
        let entries = svc.message_entries(&t1).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[1].is_pending());
        assert_eq!(entries[1].message.id, sent.id);
        assert_eq!(entries[1].message.body.as_deref(), Some("Tuesday at 10"));

        // The push echo of the same row lands on the confirmed entry.
        svc.pump().await;
        let entries = svc.message_entries(&t1).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[1].is_pending());
        assert_eq!(entries[1].message.id, sent.id);
        assert_eq!(entries[0].message.id.as_str(), "m0");

        let top = &svc.threads()[0];
        assert_eq!(top.last_message_preview.as_deref(), Some("Tuesday at 10"));
        assert_eq!(top.last_activity_at, sent.created_at);
        assert_consistent(&svc);
    }

    #[tokio::test]
    async fn test_failed_send_discards_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        backend.seed_thread(thread("t1", "p1", Utc::now()));
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.open_thread(&t1).await.unwrap();

        backend.fail_next_writes(1);
        let err = svc.send_message(&t1, "hello", None).await.unwrap_err();
        assert!(err.is_remote());
        assert!(svc.messages(&t1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unopened_thread_applies_result_locally() {
        let backend = Arc::new(MemoryBackend::new());
        backend.hold_acks(true);
        let t1 = ThreadId::from("t1");
        backend.seed_thread(thread("t1", "p1", Utc::now() - Duration::hours(1)));
        let svc = service(&backend);
        svc.bind(Some(client())).await;

        let sent = svc
            .send_message(&t1, "", Some("https://files.example/quote.pdf"))
            .await
            .unwrap();
        let t = svc.thread(&t1).unwrap();
        assert_eq!(t.last_activity_at, sent.created_at);
        assert_eq!(t.last_message_preview.as_deref(), Some("Sent an attachment"));
        assert_eq!(t.provider_unread_count, 1);
        assert_eq!(svc.unread_total(), 0);
    }

    #[tokio::test]
    async fn test_same_insert_twice_counts_once() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        let start = Utc::now() - Duration::minutes(5);
        backend.seed_thread(thread("t1", "p1", start));
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.open_thread(&t1).await.unwrap();

        let m = provider_message("m1", "t1", Utc::now(), "Arrived");
        let scope = ResourceScope::messages_in(&t1);
        backend.emit_raw(&scope, RowEvent::insert(&m));
        backend.emit_raw(&scope, RowEvent::insert(&m));
        svc.pump().await;

        assert_eq!(svc.messages(&t1).unwrap().len(), 1);
        assert_eq!(svc.unread_total(), 1);
        assert_consistent(&svc);

        backend.emit_raw(&scope, RowEvent::delete("m1"));
        backend.emit_raw(&scope, RowEvent::delete("m1"));
        svc.pump().await;
        assert!(svc.messages(&t1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_thread_read_optimistic_with_rollback() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        let start = Utc::now() - Duration::minutes(10);
        let mut seeded = thread("t1", "p1", start);
        seeded.client_unread_count = 2;
        backend.seed_thread(seeded);
        backend.seed_message(provider_message("m1", "t1", start - Duration::minutes(2), "a"));
        backend.seed_message(provider_message("m2", "t1", start, "b"));

        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.open_thread(&t1).await.unwrap();
        svc.pump().await;
        assert_eq!(svc.unread_total(), 2);

        backend.fail_next_writes(1);
        assert!(svc.mark_thread_read(&t1).await.unwrap_err().is_remote());
        assert_eq!(svc.unread_total(), 2);
        assert!(svc.messages(&t1).unwrap().iter().all(|m| !m.read_by_client));
        assert_consistent(&svc);

        svc.mark_thread_read(&t1).await.unwrap();
        assert_eq!(svc.unread_total(), 0);
        assert!(svc.messages(&t1).unwrap().iter().all(|m| m.read_by_client));

        svc.pump().await;
        assert_eq!(svc.unread_total(), 0);
        assert_consistent(&svc);

        let writes = backend.write_count();
        svc.mark_thread_read(&t1).await.unwrap();
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_switching_threads_discards_late_ack_of_previous() {
        let backend = Arc::new(MemoryBackend::new());
        backend.hold_acks(true);
        let now = Utc::now();
        backend.seed_thread(thread("a", "p1", now));
        backend.seed_thread(thread("b", "p2", now));
        let (a, b) = (ThreadId::from("a"), ThreadId::from("b"));

        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.set_active_thread(Some(a.clone())).await.unwrap();
        let stale = backend.sinks_for(&ResourceScope::messages_in(&a)).remove(0);
        svc.set_active_thread(Some(b.clone())).await.unwrap();

        stale.send(ChannelSignal::Subscribed);
        stale.send(ChannelSignal::Change(RowEvent::insert(&provider_message(
            "late", "b", now, "wrong scope",
        ))));
        svc.pump().await;

        assert_eq!(svc.active_thread(), Some(b.clone()));
        assert_eq!(svc.open_threads(), vec![b.clone()]);
        assert!(svc.messages(&b).unwrap().is_empty());
        assert_eq!(svc.messages(&a), None);
        assert_eq!(svc.thread_phase(&a), StreamPhase::Closed);
        assert_eq!(svc.thread_phase(&b), StreamPhase::Opening);
        assert_eq!(backend.open_subscriptions(&ResourceScope::messages_in(&a)), 0);

        // Closing twice, or closing what never opened, is fine.
        svc.close_thread(&a).await;
        svc.close_thread(&ThreadId::from("never")).await;
    }

    /// Store whose message fetch for one thread waits until released.
    struct SlowThreadStore {
        inner: Arc<MemoryBackend>,
        slow: ThreadId,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RemoteStore for SlowThreadStore {
        async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
            self.inner.fetch_threads(identity).await
        }

        async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError> {
            if thread_id == &self.slow {
                self.gate.notified().await;
            }
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
            self.inner.mark_read(identity, target).await
        }

        async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
            self.inner.delete_notification(identity, id).await
        }
    }

    #[tokio::test]
    async fn test_snapshot_of_abandoned_thread_is_discarded() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        backend.seed_thread(thread("a", "p1", now));
        backend.seed_thread(thread("b", "p2", now));
        backend.seed_message(provider_message("ma", "a", now, "belongs to a"));
        let (a, b) = (ThreadId::from("a"), ThreadId::from("b"));

        let gate = Arc::new(Notify::new());
        let store = Arc::new(SlowThreadStore {
            inner: backend.clone(),
            slow: a.clone(),
            gate: gate.clone(),
        });
        let svc = Arc::new(MessagingService::new(
            store,
            backend.clone(),
            &RealtimeConfig::default(),
        ));
        svc.bind(Some(client())).await;

        let opening_a = tokio::spawn({
            let svc = svc.clone();
            let a = a.clone();
            async move { svc.set_active_thread(Some(a)).await }
        });
        while backend.open_subscriptions(&ResourceScope::messages_in(&a)) == 0 {
            tokio::task::yield_now().await;
        }

        svc.set_active_thread(Some(b.clone())).await.unwrap();
        gate.notify_one();
        opening_a.await.unwrap().unwrap();
        svc.pump().await;

        assert!(svc.messages(&b).unwrap().is_empty());
        assert_eq!(svc.messages(&a), None);
    }

    /// Store whose thread fetch, once armed, reads its rows and then waits
    /// for release before returning them.
    struct LateThreadsStore {
        inner: Arc<MemoryBackend>,
        armed: AtomicBool,
        parked: AtomicBool,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RemoteStore for LateThreadsStore {
        async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
            let rows = self.inner.fetch_threads(identity).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.store(true, Ordering::SeqCst);
                self.gate.notified().await;
            }
            rows
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
            self.inner.mark_read(identity, target).await
        }

        async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
            self.inner.delete_notification(identity, id).await
        }
    }

    #[tokio::test]
    async fn test_pushes_during_thread_refresh_survive_the_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        backend.seed_thread(thread("t1", "p1", now - Duration::hours(1)));
        let gate = Arc::new(Notify::new());
        let store = Arc::new(LateThreadsStore {
            inner: backend.clone(),
            armed: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            gate: gate.clone(),
        });
        let svc = Arc::new(MessagingService::new(
            store.clone(),
            backend.clone(),
            &RealtimeConfig::default(),
        ));
        svc.bind(Some(client())).await;
        svc.pump().await;

        store.armed.store(true, Ordering::SeqCst);
        let refreshing = tokio::spawn({
            let svc = svc.clone();
            async move { svc.refresh_threads().await }
        });
        while !store.parked.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let mut bumped = thread("t1", "p1", now);
        bumped.client_unread_count = 2;
        backend.publish_thread(bumped);
        backend.publish_thread(thread("t2", "p2", now - Duration::minutes(5)));
        svc.pump().await;
        assert_eq!(svc.unread_total(), 2);

        gate.notify_one();
        refreshing.await.unwrap().unwrap();

        let ids: Vec<_> = svc.threads().iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, ["t1", "t2"]);
        assert_eq!(svc.thread(&ThreadId::from("t1")).unwrap().client_unread_count, 2);
        assert_eq!(svc.unread_total(), 2);
        assert_consistent(&svc);
    }

    #[tokio::test]
    async fn test_thread_channel_recovery_refetches_messages() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        let start = Utc::now() - Duration::minutes(10);
        backend.seed_thread(thread("t1", "p1", start));
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.open_thread(&t1).await.unwrap();
        svc.pump().await;

        let scope = ResourceScope::messages_in(&t1);
        backend.drop_channels(&scope, "timeout");
        svc.pump().await;
        assert_eq!(svc.thread_phase(&t1), StreamPhase::Errored);

        backend.seed_message(provider_message("missed", "t1", Utc::now(), "while offline"));
        backend.recover_channels(&scope);
        svc.pump().await;

        assert_eq!(svc.thread_phase(&t1), StreamPhase::Open);
        assert_eq!(svc.messages(&t1).unwrap().len(), 1);
        assert!(!svc.realtime_degraded());
    }

    #[tokio::test]
    async fn test_identity_change_resets_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let t1 = ThreadId::from("t1");
        backend.seed_thread(thread("t1", "p1", Utc::now()));
        let svc = service(&backend);
        svc.bind(Some(client())).await;
        svc.set_active_thread(Some(t1.clone())).await.unwrap();

        svc.bind(Some(Identity::new("p1", Role::Provider))).await;
        svc.pump().await;
        assert_eq!(svc.active_thread(), None);
        assert!(svc.open_threads().is_empty());
        assert_eq!(svc.threads().len(), 1);
        assert_eq!(backend.total_open_subscriptions(), 1);

        svc.bind(None).await;
        assert!(svc.threads().is_empty());
        assert_eq!(svc.list_phase(), StreamPhase::Closed);
        assert_eq!(backend.total_open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_marketplace_walkthrough() {
        let backend = Arc::new(MemoryBackend::new());
        let config = RealtimeConfig::default();
        let messaging = service(&backend);
        let notifications = NotificationService::new(backend.clone(), backend.clone(), &config);

        messaging.bind(Some(client())).await;
        notifications.bind(Some(client())).await;
        messaging.pump().await;
        notifications.pump().await;
        assert!(messaging.threads().is_empty());
        assert_eq!(notifications.unread_count(), 0);

        let t0 = Utc::now() - Duration::hours(1);
        backend.publish_thread(thread("t1", "p1", t0));
        messaging.pump().await;
        let ids: Vec<_> = messaging.threads().iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, ["t1"]);

        backend.publish_notification(Notification {
            id: NotificationId::from("n1"),
            recipient_id: UserId::from("u1"),
            kind: NotificationType::BookingAccepted,
            title: "Booking accepted".into(),
            body: "Pat accepted your Tuesday booking".into(),
            created_at: Utc::now(),
            is_read: false,
            booking_id: Some("b1".into()),
            thread_id: Some(ThreadId::from("t1")),
        });
        notifications.pump().await;
        assert_eq!(notifications.unread_count(), 1);

        notifications.mark_all_read().await.unwrap();
        assert_eq!(notifications.unread_count(), 0);
        assert!(notifications.notification(&NotificationId::from("n1")).unwrap().is_read);

        let t1 = ThreadId::from("t1");
        messaging.open_thread(&t1).await.unwrap();
        messaging.pump().await;
        let m1 = provider_message("m1", "t1", Utc::now(), "On my way");
        backend.emit_raw(&ResourceScope::messages_in(&t1), RowEvent::insert(&m1));
        messaging.pump().await;

        let top = &messaging.threads()[0];
        assert_eq!(top.id, t1);
        assert_eq!(top.last_activity_at, m1.created_at);
        assert_eq!(top.client_unread_count, 1);
        assert_eq!(messaging.unread_total(), 1);
        assert_consistent(&messaging);
        assert_eq!(notifications.unread_count(), notifications.recompute_unread());
    }
}
