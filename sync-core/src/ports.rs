//! Boundaries the sync services talk through. Adapters: [`crate::pg_store`]
//! and [`crate::memory`] for the store, `sync-realtime` and
//! [`crate::memory`] for the push transport.

use async_trait::async_trait;

use crate::error::{ChannelError, RemoteError};
use crate::scope::{EventSink, ResourceScope, SubscriptionHandle};
use crate::types::{
    Identity, Message, NewMessage, NewThread, Notification, NotificationId, ReadTarget, Thread,
    ThreadId,
};

/// Request/response access to the persistent store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Threads where the identity is either participant, newest activity first.
    async fn fetch_threads(&self, identity: &Identity) -> Result<Vec<Thread>, RemoteError>;

    /// Messages of one thread, oldest first.
    async fn fetch_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RemoteError>;

    async fn fetch_notifications(
        &self,
        identity: &Identity,
    ) -> Result<Vec<Notification>, RemoteError>;

    /// Returns the thread for the pair, creating it only when none exists.
    /// Must be atomic on the store side: concurrent calls for the same pair
    /// yield the same thread.
    async fn create_thread(&self, pair: &NewThread) -> Result<Thread, RemoteError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, RemoteError>;

    async fn mark_read(&self, identity: &Identity, target: &ReadTarget) -> Result<(), RemoteError>;

    async fn delete_notification(
        &self,
        identity: &Identity,
        id: &NotificationId,
    ) -> Result<(), RemoteError>;
}

/// Publish/subscribe facility keyed by resource scope.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Starts delivering the scope's signals into `sink`. The acknowledgement
    /// arrives as a `Subscribed` signal, possibly after this returns.
    async fn subscribe(
        &self,
        scope: &ResourceScope,
        sink: EventSink,
    ) -> Result<SubscriptionHandle, ChannelError>;

    /// Stops delivery. Unknown or already-released handles are not an error.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ChannelError>;
}
