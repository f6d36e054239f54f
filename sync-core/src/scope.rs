use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::types::{ThreadId, UserId};

/// Table-like resource a push channel follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Threads,
    Messages,
    Notifications,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Threads => "threads",
            Resource::Messages => "messages",
            Resource::Notifications => "notifications",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeFilter {
    /// Rows where the user is either participant.
    Participant(UserId),
    /// Rows belonging to one thread.
    Thread(ThreadId),
    /// Rows addressed to the user.
    Recipient(UserId),
}

/// A resource plus the filter that narrows it to one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceScope {
    pub resource: Resource,
    pub filter: ScopeFilter,
}

impl ResourceScope {
    pub fn threads_of(user: &UserId) -> Self {
        Self {
            resource: Resource::Threads,
            filter: ScopeFilter::Participant(user.clone()),
        }
    }

    pub fn messages_in(thread: &ThreadId) -> Self {
        Self {
            resource: Resource::Messages,
            filter: ScopeFilter::Thread(thread.clone()),
        }
    }

    pub fn notifications_for(user: &UserId) -> Self {
        Self {
            resource: Resource::Notifications,
            filter: ScopeFilter::Recipient(user.clone()),
        }
    }

    /// Key of the stream carrying this scope's change events.
    pub fn stream_key(&self) -> String {
        let (column, value) = match &self.filter {
            ScopeFilter::Participant(user) => ("participant", user.as_str()),
            ScopeFilter::Thread(thread) => ("thread_id", thread.as_str()),
            ScopeFilter::Recipient(user) => ("recipient_id", user.as_str()),
        };
        format!("STREAM:{}:{}:{}", self.resource.as_str(), column, value)
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_key())
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Tags one open attempt of one scope. Anything that completes under a token
/// that is no longer current belongs to a scope that has since moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeToken(u64);

impl ScopeToken {
    pub fn next() -> Self {
        ScopeToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change as delivered by the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub kind: ChangeKind,
    pub row: serde_json::Value,
}

impl RowEvent {
    pub fn insert<T: Serialize>(row: &T) -> Self {
        Self::with_kind(ChangeKind::Insert, row)
    }

    pub fn update<T: Serialize>(row: &T) -> Self {
        Self::with_kind(ChangeKind::Update, row)
    }

    pub fn delete(id: &str) -> Self {
        Self {
            kind: ChangeKind::Delete,
            row: serde_json::json!({ "id": id }),
        }
    }

    fn with_kind<T: Serialize>(kind: ChangeKind, row: &T) -> Self {
        let row = serde_json::to_value(row).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize change row: {}", e);
            serde_json::Value::Null
        });
        Self { kind, row }
    }

    /// The `id` column of the row, rendered as text.
    pub fn row_id(&self) -> Option<String> {
        match self.row.get("id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// What a transport reports for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// The channel is acknowledged; changes flow from here on.
    Subscribed,
    Change(RowEvent),
    /// The transport is retrying after a drop.
    Reconnecting,
    Dropped { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopedSignal {
    pub token: ScopeToken,
    pub signal: ChannelSignal,
}

pub type SignalSender = mpsc::UnboundedSender<ScopedSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<ScopedSignal>;

/// Callback handed to a transport on subscribe. Every signal it forwards is
/// stamped with the token of the open attempt it was created for.
#[derive(Debug, Clone)]
pub struct EventSink {
    token: ScopeToken,
    tx: SignalSender,
}

impl EventSink {
    pub fn new(token: ScopeToken, tx: SignalSender) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> ScopeToken {
        self.token
    }

    /// Returns false once the receiving side is gone.
    pub fn send(&self, signal: ChannelSignal) -> bool {
        self.tx
            .send(ScopedSignal {
                token: self.token,
                signal,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Opaque handle returned by a transport's `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);
