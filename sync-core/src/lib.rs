pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod memory;
pub mod normalize;
pub mod pg_store;
pub mod ports;
pub mod redis;
pub mod revision;
pub mod schema;
pub mod scope;
pub mod session;
pub mod types;

pub use config::{BackendKind, Config, RealtimeConfig};
pub use context::SyncContext;
pub use db::DbPool;
pub use error::{ChannelError, RemoteError, Result, SyncError};
pub use memory::MemoryBackend;
pub use pg_store::PgRemoteStore;
pub use ports::{PushTransport, RemoteStore};
pub use redis::{ChangePublisher, RedisPool};
pub use revision::Revisions;
pub use scope::{
    ChangeKind, ChannelSignal, EventSink, Resource, ResourceScope, RowEvent, ScopeFilter,
    ScopeToken, ScopedSignal, SignalReceiver, SignalSender, SubscriptionHandle,
};
pub use session::{identity_from_token, issue_token, SessionBinding};
pub use types::{
    Identity, Message, MessageId, NewMessage, NewThread, Notification, NotificationId,
    NotificationType, ReadTarget, Role, Thread, ThreadId, UserId,
};
