use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Account identifier issued by the identity provider.
    UserId
);
string_id!(ThreadId);
string_id!(MessageId);
string_id!(NotificationId);

/// Which side of the marketplace an account (or a thread participant) is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Provider,
}

impl Role {
    pub fn other(self) -> Self {
        match self {
            Role::Client => Role::Provider,
            Role::Provider => Role::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Provider => "provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Role::Client),
            "provider" => Some(Role::Provider),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signed-in account every identity-scoped operation is keyed off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            role,
        }
    }
}

/// A conversation between one client and one provider.
///
/// The client side is always the initiator and the provider side the
/// counterparty, so the `(client_id, provider_id)` pair identifies the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub client_id: UserId,
    pub provider_id: UserId,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub client_unread_count: u32,
    #[serde(default)]
    pub provider_unread_count: u32,
}

impl Thread {
    pub fn participant(&self, role: Role) -> &UserId {
        match role {
            Role::Client => &self.client_id,
            Role::Provider => &self.provider_id,
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.client_id == user || &self.provider_id == user
    }

    pub fn unread_for(&self, role: Role) -> u32 {
        match role {
            Role::Client => self.client_unread_count,
            Role::Provider => self.provider_unread_count,
        }
    }

    pub fn unread_for_mut(&mut self, role: Role) -> &mut u32 {
        match role {
            Role::Client => &mut self.client_unread_count,
            Role::Provider => &mut self.provider_unread_count,
        }
    }

    /// Display name of whoever sits opposite `role`.
    pub fn counterpart_name(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.provider_name,
            Role::Provider => &self.client_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub sender_role: Role,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by_client: bool,
    #[serde(default)]
    pub read_by_provider: bool,
}

impl Message {
    pub fn is_read_by(&self, role: Role) -> bool {
        match role {
            Role::Client => self.read_by_client,
            Role::Provider => self.read_by_provider,
        }
    }

    pub fn set_read_by(&mut self, role: Role, read: bool) {
        match role {
            Role::Client => self.read_by_client = read,
            Role::Provider => self.read_by_provider = read,
        }
    }

    /// Structural identity used before the server id of a sent message is known.
    /// The timestamp is compared at microsecond precision, which is what the
    /// store keeps.
    pub fn dedupe_key(&self) -> (&ThreadId, &UserId, DateTime<Utc>, &str) {
        (
            &self.thread_id,
            &self.sender_id,
            self.created_at.trunc_subsecs(6),
            self.body.as_deref().unwrap_or(""),
        )
    }

    /// Text shown in the thread list for the latest message.
    pub fn preview(&self) -> String {
        match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => body.chars().take(120).collect(),
            _ => "Sent an attachment".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    BookingRequest,
    BookingAccepted,
    BookingDeclined,
    BookingCancelled,
    BookingCompleted,
    NewMessage,
    PaymentReceived,
    ReviewReceived,
    System,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::BookingRequest => "booking_request",
            NotificationType::BookingAccepted => "booking_accepted",
            NotificationType::BookingDeclined => "booking_declined",
            NotificationType::BookingCancelled => "booking_cancelled",
            NotificationType::BookingCompleted => "booking_completed",
            NotificationType::NewMessage => "new_message",
            NotificationType::PaymentReceived => "payment_received",
            NotificationType::ReviewReceived => "review_received",
            NotificationType::System => "system",
        }
    }

    /// Unknown or missing types fall back to `System`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "booking_request" => NotificationType::BookingRequest,
            "booking_accepted" => NotificationType::BookingAccepted,
            "booking_declined" => NotificationType::BookingDeclined,
            "booking_cancelled" | "booking_canceled" => NotificationType::BookingCancelled,
            "booking_completed" => NotificationType::BookingCompleted,
            "new_message" | "message" => NotificationType::NewMessage,
            "payment_received" => NotificationType::PaymentReceived,
            "review_received" => NotificationType::ReviewReceived,
            _ => NotificationType::System,
        }
    }
}

/// A feed entry. Build these from remote rows with
/// [`Notification::from_row`](crate::normalize), which guarantees `title` and
/// `body` are plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
}

/// Request to open (or find) the thread between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThread {
    pub client_id: UserId,
    pub provider_id: UserId,
}

impl NewThread {
    /// Places the two accounts on their fixed sides based on who is asking.
    pub fn between(me: &Identity, other: &UserId) -> Self {
        match me.role {
            Role::Client => Self {
                client_id: me.id.clone(),
                provider_id: other.clone(),
            },
            Role::Provider => Self {
                client_id: other.clone(),
                provider_id: me.id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    /// Client-stamped creation time. The stored row keeps it at microsecond
    /// precision, so the confirmed row matches the optimistic entry's
    /// structural key.
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn to_message(&self, id: MessageId) -> Message {
        let mut message = Message {
            id,
            thread_id: self.thread_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_role: self.sender_role,
            body: self.body.clone(),
            attachment_url: self.attachment_url.clone(),
            created_at: self.created_at,
            read_by_client: false,
            read_by_provider: false,
        };
        message.set_read_by(self.sender_role, true);
        message
    }
}

/// What a `mark_read` write applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadTarget {
    Thread(ThreadId),
    Notification(NotificationId),
    AllNotifications,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_places_participants_by_role() {
        let client = Identity::new("u1", Role::Client);
        let pair = NewThread::between(&client, &UserId::from("p1"));
        assert_eq!(pair.client_id, UserId::from("u1"));
        assert_eq!(pair.provider_id, UserId::from("p1"));

        let provider = Identity::new("p1", Role::Provider);
        assert_eq!(NewThread::between(&provider, &UserId::from("u1")), pair);
    }

    #[test]
    fn test_sent_message_is_read_by_its_sender() {
        let draft = NewMessage {
            thread_id: ThreadId::from("t1"),
            sender_id: UserId::from("p1"),
            sender_role: Role::Provider,
            body: Some("hello".into()),
            attachment_url: None,
            created_at: Utc::now(),
        };
        let message = draft.to_message(MessageId::from("m1"));
        assert!(message.is_read_by(Role::Provider));
        assert!(!message.is_read_by(Role::Client));
    }

    #[test]
    fn test_dedupe_key_ignores_sub_microsecond_precision() {
        let stamped = DateTime::<Utc>::from_timestamp(1_790_000_000, 889_792_060).unwrap();
        let draft = NewMessage {
            thread_id: ThreadId::from("t1"),
            sender_id: UserId::from("u1"),
            sender_role: Role::Client,
            body: Some("see you at 10".into()),
            attachment_url: None,
            created_at: stamped,
        };
        let pending = draft.to_message(MessageId::from("local-1"));
        let mut stored = draft.to_message(MessageId::from("m1"));
        stored.created_at = stamped.trunc_subsecs(6);

        assert_ne!(pending.created_at, stored.created_at);
        assert_eq!(pending.dedupe_key(), stored.dedupe_key());
    }

    #[test]
    fn test_unknown_notification_type_falls_back_to_system() {
        assert_eq!(NotificationType::parse("Booking_Request"), NotificationType::BookingRequest);
        assert_eq!(NotificationType::parse("payout.sent"), NotificationType::System);
    }
}
