use std::cmp::Ordering;
use sync_core::{Notification, NotificationId, Revisions, UserId};
use tracing;

/// Notifications of one recipient, newest first, with an unread counter that
/// is kept up to date on every change.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    recipient: Option<UserId>,
    items: Vec<Notification>,
    unread: usize,
    revisions: Revisions<NotificationId>,
}

fn newest_first(a: &Notification, b: &Notification) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

impl NotificationFeed {
    pub fn new(recipient: Option<UserId>) -> Self {
        Self {
            recipient,
            items: Vec::new(),
            unread: 0,
            revisions: Revisions::new(),
        }
    }

    pub fn recipient(&self) -> Option<&UserId> {
        self.recipient.as_ref()
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.items.iter().find(|n| &n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Incrementally maintained count.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Counts unread items from scratch.
    pub fn recompute_unread(&self) -> usize {
        self.items.iter().filter(|n| !n.is_read).count()
    }

    fn accepts(&self, notification: &Notification) -> bool {
        match &self.recipient {
            Some(recipient) => &notification.recipient_id == recipient,
            None => false,
        }
    }

    /// Revision to pass to [`merge_snapshot`](Self::merge_snapshot) for a
    /// fetch that starts now.
    pub fn revision(&self) -> u64 {
        self.revisions.current()
    }

    /// Replaces the whole feed with a snapshot.
    pub fn replace_all(&mut self, rows: Vec<Notification>) {
        let since = self.revisions.current();
        self.merge_snapshot(rows, since);
    }

    /// Applies a snapshot fetched from revision `since`. Items changed or
    /// removed after `since` keep their local state; everything else follows
    /// the snapshot. Returns false when a later snapshot was already applied.
    pub fn merge_snapshot(&mut self, rows: Vec<Notification>, since: u64) -> bool {
        if !self.revisions.accepts_snapshot(since) {
            tracing::debug!("Ignoring notification snapshot from revision {}", since);
            return false;
        }

        let mut items: Vec<Notification> = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.accepts(&row) {
                tracing::warn!("Dropping notification {} addressed to {}", row.id, row.recipient_id);
                continue;
            }
            if self.revisions.changed_since(&row.id, since) || items.iter().any(|n| n.id == row.id) {
                continue;
            }
            items.push(row);
        }
        for item in self.items.drain(..) {
            if self.revisions.changed_since(&item.id, since) && !items.iter().any(|n| n.id == item.id) {
                items.push(item);
            }
        }

        items.sort_by(newest_first);
        self.items = items;
        self.unread = self.recompute_unread();
        self.revisions.snapshot_applied(since);
        true
    }

    /// Inserts a new notification or replaces the one with the same id.
    /// Returns false when nothing changed.
    pub fn upsert(&mut self, notification: Notification) -> bool {
        if !self.accepts(&notification) {
            tracing::debug!(
                "Ignoring notification {} for another recipient",
                notification.id
            );
            return false;
        }
        self.revisions.touch(&notification.id);

        if let Some(pos) = self.items.iter().position(|n| n.id == notification.id) {
            if self.items[pos] == notification {
                return false;
            }
            let old = self.items.remove(pos);
            self.adjust(old.is_read, notification.is_read);
            if old.created_at == notification.created_at {
                self.items.insert(pos, notification);
                return true;
            }
        } else {
            self.adjust(true, notification.is_read);
        }

        let pos = self
            .items
            .partition_point(|n| newest_first(n, &notification) == Ordering::Less);
        self.items.insert(pos, notification);
        true
    }

    pub fn remove(&mut self, id: &NotificationId) -> Option<Notification> {
        self.revisions.touch(id);
        let pos = self.items.iter().position(|n| &n.id == id)?;
        let removed = self.items.remove(pos);
        if !removed.is_read {
            self.unread = self.unread.saturating_sub(1);
        }
        Some(removed)
    }

    /// Returns false when the notification is unknown or already read.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        self.set_read(id, true)
    }

    pub fn mark_unread(&mut self, id: &NotificationId) -> bool {
        self.set_read(id, false)
    }

    /// Flips every unread item in one step and returns the ids it flipped.
    pub fn mark_all_read(&mut self) -> Vec<NotificationId> {
        let flipped: Vec<NotificationId> = self
            .items
            .iter_mut()
            .filter(|n| !n.is_read)
            .map(|n| {
                n.is_read = true;
                n.id.clone()
            })
            .collect();
        for id in &flipped {
            self.revisions.touch(id);
        }
        self.unread = 0;
        flipped
    }

    /// Undoes [`mark_all_read`](Self::mark_all_read) for the given ids.
    pub fn restore_unread(&mut self, ids: &[NotificationId]) {
        for id in ids {
            self.mark_unread(id);
        }
    }

    fn set_read(&mut self, id: &NotificationId, read: bool) -> bool {
        let Some(item) = self.items.iter_mut().find(|n| &n.id == id) else {
            return false;
        };
        if item.is_read == read {
            return false;
        }
        item.is_read = read;
        self.revisions.touch(id);
        self.adjust(!read, read);
        true
    }

    fn adjust(&mut self, was_read: bool, is_read: bool) {
        match (was_read, is_read) {
            (true, false) => self.unread += 1,
            (false, true) => self.unread = self.unread.saturating_sub(1),
            _ => {}
        }
    }
}
