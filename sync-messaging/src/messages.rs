use std::collections::HashSet;
use sync_core::{Message, MessageId, Role, ThreadId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Sent locally, not yet confirmed by the store.
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub message: Message,
    pub status: DeliveryStatus,
}

impl MessageEntry {
    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

/// What [`MessageLog::apply`] did with a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Took the place of the matching pending entry.
    Confirmed,
    Updated,
    Unchanged,
}

impl Applied {
    /// True when the row is new to this log.
    pub fn is_new(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Confirmed)
    }
}

/// Messages of one thread, oldest first, including pending local sends.
#[derive(Debug)]
pub struct MessageLog {
    thread_id: ThreadId,
    entries: Vec<MessageEntry>,
}

impl MessageLog {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            entries: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    fn insert_sorted(&mut self, entry: MessageEntry) {
        let pos = self
            .entries
            .partition_point(|e| e.message.created_at <= entry.message.created_at);
        self.entries.insert(pos, entry);
    }

    /// Adds an optimistic entry for a send that is still in flight.
    pub fn push_pending(&mut self, message: Message) {
        self.insert_sorted(MessageEntry {
            message,
            status: DeliveryStatus::Pending,
        });
    }

    /// Drops the pending entry with the given local id.
    pub fn discard_pending(&mut self, local_id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.is_pending() && &e.message.id == local_id));
        self.entries.len() != before
    }

    /// Merges an authoritative row. A known id is replaced, a pending entry
    /// with the same structural key is confirmed in place, anything else is
    /// inserted in order. Applying the same row twice is the same as once.
    pub fn apply(&mut self, message: Message) -> Applied {
        if message.thread_id != self.thread_id {
            return Applied::Unchanged;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| !e.is_pending() && e.message.id == message.id)
        {
            if entry.message == message {
                return Applied::Unchanged;
            }
            entry.message = message;
            return Applied::Updated;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.is_pending() && e.message.dedupe_key() == message.dedupe_key())
        {
            entry.message = message;
            entry.status = DeliveryStatus::Confirmed;
            return Applied::Confirmed;
        }

        self.insert_sorted(MessageEntry {
            message,
            status: DeliveryStatus::Confirmed,
        });
        Applied::Inserted
    }

    /// Settles the pending entry `local_id` with the row the store returned
    /// for it. If that row already arrived by push or snapshot, the pending
    /// entry is dropped instead.
    pub fn confirm(&mut self, local_id: &MessageId, message: Message) -> Applied {
        if message.thread_id != self.thread_id {
            return Applied::Unchanged;
        }

        if self
            .entries
            .iter()
            .any(|e| !e.is_pending() && e.message.id == message.id)
        {
            self.discard_pending(local_id);
            return self.apply(message);
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.is_pending() && &e.message.id == local_id)
        {
            entry.message = message;
            entry.status = DeliveryStatus::Confirmed;
            return Applied::Confirmed;
        }

        self.apply(message)
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.message.id != id);
        self.entries.len() != before
    }

    /// Takes a fetched snapshot as the new base. Pending sends the snapshot
    /// does not contain yet survive, and so do confirmed rows newer than the
    /// snapshot's newest row, since those arrived by push after the fetch.
    pub fn merge_snapshot(&mut self, rows: Vec<Message>) {
        let newest = rows.iter().map(|m| m.created_at).max();
        let ids: HashSet<MessageId> = rows.iter().map(|m| m.id.clone()).collect();

        let carried: Vec<MessageEntry> = self
            .entries
            .drain(..)
            .filter(|e| match e.status {
                DeliveryStatus::Pending => !rows.iter().any(|m| m.dedupe_key() == e.message.dedupe_key()),
                DeliveryStatus::Confirmed => {
                    !ids.contains(&e.message.id)
                        && newest.map(|n| e.message.created_at > n).unwrap_or(false)
                }
            })
            .collect();

        for row in rows {
            if row.thread_id == self.thread_id && !self.entries.iter().any(|e| e.message.id == row.id) {
                self.insert_sorted(MessageEntry {
                    message: row,
                    status: DeliveryStatus::Confirmed,
                });
            }
        }
        for entry in carried {
            self.insert_sorted(entry);
        }
    }

    /// Flips the read flag of `role` on every confirmed message `me` did not
    /// send. Returns the flipped ids.
    pub fn mark_read_by(&mut self, role: Role, me: &UserId) -> Vec<MessageId> {
        self.entries
            .iter_mut()
            .filter(|e| !e.is_pending() && &e.message.sender_id != me && !e.message.is_read_by(role))
            .map(|e| {
                e.message.set_read_by(role, true);
                e.message.id.clone()
            })
            .collect()
    }

    pub fn restore_unread(&mut self, role: Role, ids: &[MessageId]) {
        for entry in self.entries.iter_mut().filter(|e| ids.contains(&e.message.id)) {
            entry.message.set_read_by(role, false);
        }
    }

    /// Loaded messages from others that `role` has not read.
    pub fn unread_for(&self, role: Role, me: &UserId) -> usize {
        self.entries
            .iter()
            .filter(|e| &e.message.sender_id != me && !e.message.is_read_by(role))
            .count()
    }
}
