//! In-process remote store and push transport.
//!
//! Behaves like the Postgres + Redis pair: thread creation is unique per
//! participant pair, writes fan change events out to every open subscription
//! whose scope matches, and acknowledgements can be held back to simulate a
//! slow channel. Failure injection hooks make the error paths reachable.

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ChannelError, RemoteError};
use crate::ports::{PushTransport, RemoteStore};
use crate::scope::{ChannelSignal, EventSink, ResourceScope, RowEvent, SubscriptionHandle};
use crate::types::{
    Identity, Message, MessageId, NewMessage, NewThread, Notification, NotificationId, ReadTarget,
    Thread, ThreadId, UserId,
};

struct Subscription {
    scope: ResourceScope,
    sink: EventSink,
}

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<UserId, String>,
    threads: HashMap<ThreadId, Thread>,
    messages: Vec<Message>,
    notifications: Vec<Notification>,
    subscriptions: HashMap<u64, Subscription>,
    sink_history: Vec<(ResourceScope, EventSink)>,
    next_handle: u64,
    hold_acks: bool,
    failing_fetches: usize,
    failing_writes: usize,
    failing_subscribes: usize,
    writes: usize,
}

impl MemoryState {
    fn emit(&self, scope: &ResourceScope, event: &RowEvent) {
        for sub in self.subscriptions.values().filter(|s| &s.scope == scope) {
            sub.sink.send(ChannelSignal::Change(event.clone()));
        }
    }

    fn emit_thread(&self, thread: &Thread, event: &RowEvent) {
        self.emit(&ResourceScope::threads_of(&thread.client_id), event);
        self.emit(&ResourceScope::threads_of(&thread.provider_id), event);
    }

    fn take_fetch_failure(&mut self) -> Result<(), RemoteError> {
        if self.failing_fetches > 0 {
            self.failing_fetches -= 1;
            return Err(RemoteError::Transport("injected fetch failure".to_string()));
        }
        Ok(())
    }

    fn take_write_failure(&mut self) -> Result<(), RemoteError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(RemoteError::Server("injected write failure".to_string()));
        }
        self.writes += 1;
        Ok(())
    }

    fn display_name(&self, user: &UserId) -> String {
        self.profiles
            .get(user)
            .cloned()
            .unwrap_or_else(|| user.to_string())
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write; the data is
        // still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_profile(&self, user: impl Into<String>, display_name: impl Into<String>) {
        self.lock()
            .profiles
            .insert(UserId(user.into()), display_name.into());
    }

    /// When held, subscriptions are registered but not acknowledged until
    /// [`ack`](Self::ack) is called.
    pub fn hold_acks(&self, hold: bool) {
        self.lock().hold_acks = hold;
    }

    /// Acknowledges every open subscription on `scope`.
    pub fn ack(&self, scope: &ResourceScope) {
        let state = self.lock();
        for sub in state.subscriptions.values().filter(|s| &s.scope == scope) {
            sub.sink.send(ChannelSignal::Subscribed);
        }
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().failing_fetches = count;
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().failing_subscribes = count;
    }

    /// Successful writes served so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn open_subscriptions(&self, scope: &ResourceScope) -> usize {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| &s.scope == scope)
            .count()
    }

    pub fn total_open_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Every sink ever handed out for `scope`, including released ones.
    pub fn sinks_for(&self, scope: &ResourceScope) -> Vec<EventSink> {
        self.lock()
            .sink_history
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, sink)| sink.clone())
            .collect()
    }

    /// Reports a transport drop to every open subscription on `scope`.
    pub fn drop_channels(&self, scope: &ResourceScope, reason: &str) {
        let state = self.lock();
        for sub in state.subscriptions.values().filter(|s| &s.scope == scope) {
            sub.sink.send(ChannelSignal::Dropped {
                reason: reason.to_string(),
            });
        }
    }

    /// Transport-side recovery after a drop: `Reconnecting` then `Subscribed`.
    pub fn recover_channels(&self, scope: &ResourceScope) {
        let state = self.lock();
        for sub in state.subscriptions.values().filter(|s| &s.scope == scope) {
            sub.sink.send(ChannelSignal::Reconnecting);
            sub.sink.send(ChannelSignal::Subscribed);
        }
    }

    /// Delivers a raw event without touching stored rows.
    pub fn emit_raw(&self, scope: &ResourceScope, event: RowEvent) {
        self.lock().emit(scope, &event);
    }

    /// Stores a row silently, as if it existed before anyone subscribed.
    pub fn seed_thread(&self, thread: Thread) {
        self.lock().threads.insert(thread.id.clone(), thread);
    }

    pub fn seed_message(&self, message: Message) {
        self.lock().messages.push(message);
    }

    pub fn seed_notification(&self, notification: Notification) {
        self.lock().notifications.push(notification);
    }

    /// Server-side producer path: stores the thread and announces it.
    pub fn publish_thread(&self, thread: Thread) {
        let mut state = self.lock();
        let event = if state.threads.contains_key(&thread.id) {
            RowEvent::update(&thread)
        } else {
            RowEvent::insert(&thread)
        };
        state.emit_thread(&thread, &event);
        state.threads.insert(thread.id.clone(), thread);
    }

    /// Server-side producer path: stores the notification and announces it.
    pub fn publish_notification(&self, notification: Notification) {
        let mut state = self.lock();
        state.emit(
            &ResourceScope::notifications_for(&notification.recipient_id),
            &RowEvent::insert(&notification),
        );
        state.notifications.push(notification);
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn stored_message_count(&self, thread_id: &ThreadId) -> usize {
        self.lock()
            .messages
            .iter()
            .filter(|m| &m.thread_id == thread_id)
            .count()
    }

    pub fn stored_unread_notifications(&self, recipient: &UserId) -> usize {
        self.lock()
            .notifications
            .iter()
            .filter(|n| &n.recipient_id == recipient && !n.is_read)
            .count()
    }
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_fetch_failure()?;

        let mut threads: Vec<Thread> = state
            .threads
            .values()
            .filter(|t| t.involves(&identity.id))
            .cloned()
            .collect();
        threads.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(threads)
    }

    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_fetch_failure()?;

        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| &m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_fetch_failure()?;

        let mut notifications: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.recipient_id == identity.id)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(notifications)
    }

    async fn create_thread(&self, pair: &NewThread) -> Result<Thread, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_write_failure()?;

        if let Some(existing) = state
            .threads
            .values()
            .find(|t| t.client_id == pair.client_id && t.provider_id == pair.provider_id)
        {
            return Ok(existing.clone());
        }

        let thread = Thread {
            id: ThreadId::generate(),
            client_id: pair.client_id.clone(),
            provider_id: pair.provider_id.clone(),
            client_name: state.display_name(&pair.client_id),
            provider_name: state.display_name(&pair.provider_id),
            last_message_preview: None,
            last_activity_at: Utc::now(),
            client_unread_count: 0,
            provider_unread_count: 0,
        };
        state.emit_thread(&thread, &RowEvent::insert(&thread));
        state.threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    async fn insert_message(&self, draft: &NewMessage) -> Result<Message, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if !state.threads.contains_key(&draft.thread_id) {
            return Err(RemoteError::NotFound(format!("thread {}", draft.thread_id)));
        }
        state.take_write_failure()?;

        let mut message = draft.to_message(MessageId::generate());
        message.created_at = message.created_at.trunc_subsecs(6);
        state.messages.push(message.clone());

        let Some(thread) = state.threads.get_mut(&draft.thread_id) else {
            return Err(RemoteError::NotFound(format!("thread {}", draft.thread_id)));
        };
        thread.last_activity_at = message.created_at;
        thread.last_message_preview = Some(message.preview());
        *thread.unread_for_mut(message.sender_role.other()) += 1;
        let thread = thread.clone();

        state.emit(&ResourceScope::messages_in(&message.thread_id), &RowEvent::insert(&message));
        state.emit_thread(&thread, &RowEvent::update(&thread));
        Ok(message)
    }

    async fn mark_read(&self, identity: &Identity, target: &ReadTarget) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_write_failure()?;

        match target {
            ReadTarget::Thread(thread_id) => {
                let Some(thread) = state.threads.get_mut(thread_id) else {
                    return Err(RemoteError::NotFound(format!("thread {}", thread_id)));
                };
                if thread.participant(identity.role) != &identity.id {
                    return Err(RemoteError::NotFound(format!("thread {}", thread_id)));
                }
                *thread.unread_for_mut(identity.role) = 0;
                let thread = thread.clone();

                let mut updated = Vec::new();
                for message in state.messages.iter_mut().filter(|m| {
                    &m.thread_id == thread_id
                        && m.sender_id != identity.id
                        && !m.is_read_by(identity.role)
                }) {
                    message.set_read_by(identity.role, true);
                    updated.push(message.clone());
                }

                let scope = ResourceScope::messages_in(thread_id);
                for message in &updated {
                    state.emit(&scope, &RowEvent::update(message));
                }
                state.emit_thread(&thread, &RowEvent::update(&thread));
            }
            ReadTarget::Notification(id) => {
                let updated: Vec<Notification> = state
                    .notifications
                    .iter_mut()
                    .filter(|n| &n.id == id && n.recipient_id == identity.id && !n.is_read)
                    .map(|n| {
                        n.is_read = true;
                        n.clone()
                    })
                    .collect();
                let scope = ResourceScope::notifications_for(&identity.id);
                for n in &updated {
                    state.emit(&scope, &RowEvent::update(n));
                }
            }
            ReadTarget::AllNotifications => {
                let updated: Vec<Notification> = state
                    .notifications
                    .iter_mut()
                    .filter(|n| n.recipient_id == identity.id && !n.is_read)
                    .map(|n| {
                        n.is_read = true;
                        n.clone()
                    })
                    .collect();
                let scope = ResourceScope::notifications_for(&identity.id);
                for n in &updated {
                    state.emit(&scope, &RowEvent::update(n));
                }
            }
        }
        Ok(())
    }

    async fn delete_notification(&self, identity: &Identity, id: &NotificationId) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.take_write_failure()?;

        let before = state.notifications.len();
        state
            .notifications
            .retain(|n| !(&n.id == id && n.recipient_id == identity.id));
        if state.notifications.len() != before {
            state.emit(
                &ResourceScope::notifications_for(&identity.id),
                &RowEvent::delete(id.as_str()),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl PushTransport for MemoryBackend {
    async fn subscribe(&self, scope: &ResourceScope, sink: EventSink) -> Result<SubscriptionHandle, ChannelError> {
        let mut state = self.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(ChannelError::Subscribe(format!("injected failure for {}", scope)));
        }

        state.next_handle += 1;
        let handle = SubscriptionHandle(state.next_handle);
        if !state.hold_acks {
            sink.send(ChannelSignal::Subscribed);
        }
        state.sink_history.push((scope.clone(), sink.clone()));
        state.subscriptions.insert(
            handle.0,
            Subscription {
                scope: scope.clone(),
                sink,
            },
        );
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChannelError> {
        self.lock().subscriptions.remove(&handle.0);
        Ok(())
    }
}
