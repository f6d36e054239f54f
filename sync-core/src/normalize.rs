//! Ingestion boundary for remote notification rows.
//!
//! Producers sometimes emit structured values where text is expected (a JSON
//! object as the title, a number as the body). Every notification row passes
//! through [`Notification::from_row`] exactly once; nothing downstream has to
//! re-check the shape.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{Notification, NotificationId, NotificationType, ThreadId, UserId};

/// Renders any JSON value as plain text.
pub fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => {
            // Rich-text producers wrap the string in one of these keys.
            for key in ["text", "message", "content"] {
                if let Some(Value::String(s)) = map.get(key) {
                    return s.clone();
                }
            }
            value.to_string()
        }
        Value::Array(_) => value.to_string(),
    }
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => {
            let text = plain_text(v);
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1"),
        _ => false,
    }
}

pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

impl Notification {
    /// Builds a notification from an untyped remote row.
    ///
    /// Returns `None` only when the row has no usable `id`; every other field
    /// is coerced. A missing `is_read` falls back to `read_at` presence.
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = optional_text(row.get("id"))?;

        let recipient = optional_text(row.get("recipient_id"))
            .or_else(|| optional_text(row.get("user_id")))
            .unwrap_or_default();

        let kind = row
            .get("type")
            .or_else(|| row.get("notification_type"))
            .map(plain_text)
            .map(|t| NotificationType::parse(&t))
            .unwrap_or(NotificationType::System);

        let created_at = timestamp(row.get("created_at")).unwrap_or_else(|| {
            tracing::warn!("Notification {} has no readable created_at", id);
            DateTime::<Utc>::default()
        });

        let is_read = match row.get("is_read") {
            Some(v) if !v.is_null() => truthy(Some(v)),
            _ => row.get("read_at").map(|v| !v.is_null()).unwrap_or(false),
        };

        Some(Notification {
            id: NotificationId(id),
            recipient_id: UserId(recipient),
            kind,
            title: row.get("title").map(plain_text).unwrap_or_default(),
            body: row
                .get("body")
                .or_else(|| row.get("message"))
                .map(plain_text)
                .unwrap_or_default(),
            created_at,
            is_read,
            booking_id: optional_text(row.get("booking_id")),
            thread_id: optional_text(row.get("thread_id")).map(ThreadId),
        })
    }
}
