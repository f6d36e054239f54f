use std::cmp::Ordering;
use sync_core::{Identity, Message, Revisions, Thread, ThreadId};
use tracing;

fn latest_first(a: &Thread, b: &Thread) -> Ordering {
    b.last_activity_at
        .cmp(&a.last_activity_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Threads of the bound identity ordered by latest activity, plus the sum of
/// the identity's unread counters.
#[derive(Debug, Default)]
pub struct ThreadList {
    identity: Option<Identity>,
    items: Vec<Thread>,
    unread_total: u32,
    revisions: Revisions<ThreadId>,
}

impl ThreadList {
    pub fn new(identity: Option<Identity>) -> Self {
        Self {
            identity,
            items: Vec::new(),
            unread_total: 0,
            revisions: Revisions::new(),
        }
    }

    pub fn items(&self) -> &[Thread] {
        &self.items
    }

    pub fn get(&self, id: &ThreadId) -> Option<&Thread> {
        self.items.iter().find(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_total(&self) -> u32 {
        self.unread_total
    }

    pub fn recompute_unread(&self) -> u32 {
        match &self.identity {
            Some(me) => self.items.iter().map(|t| t.unread_for(me.role)).sum(),
            None => 0,
        }
    }

    fn unread_of(&self, thread: &Thread) -> u32 {
        self.identity
            .as_ref()
            .map(|me| thread.unread_for(me.role))
            .unwrap_or(0)
    }

    fn accepts(&self, thread: &Thread) -> bool {
        self.identity
            .as_ref()
            .map(|me| thread.participant(me.role) == &me.id)
            .unwrap_or(false)
    }

    /// Revision to pass to [`merge_snapshot`](Self::merge_snapshot) for a
    /// fetch that starts now.
    pub fn revision(&self) -> u64 {
        self.revisions.current()
    }

    pub fn replace_all(&mut self, rows: Vec<Thread>) {
        let since = self.revisions.current();
        self.merge_snapshot(rows, since);
    }

    /// Applies a snapshot fetched from revision `since`. Threads changed or
    /// removed locally after `since` keep their local state. Returns false
    /// when a later snapshot was already applied.
    pub fn merge_snapshot(&mut self, rows: Vec<Thread>, since: u64) -> bool {
        if !self.revisions.accepts_snapshot(since) {
            tracing::debug!("Ignoring thread snapshot from revision {}", since);
            return false;
        }

        let mut items: Vec<Thread> = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.accepts(&row) {
                tracing::warn!("Dropping thread {} without the bound identity", row.id);
                continue;
            }
            if self.revisions.changed_since(&row.id, since) || items.iter().any(|t| t.id == row.id) {
                continue;
            }
            items.push(row);
        }
        for thread in self.items.drain(..) {
            if self.revisions.changed_since(&thread.id, since) && !items.iter().any(|t| t.id == thread.id) {
                items.push(thread);
            }
        }

        items.sort_by(latest_first);
        self.items = items;
        self.unread_total = self.recompute_unread();
        self.revisions.snapshot_applied(since);
        true
    }

    /// Inserts or replaces by id, keeping the order. Returns false when
    /// nothing changed.
    pub fn upsert(&mut self, thread: Thread) -> bool {
        if !self.accepts(&thread) {
            tracing::debug!("Ignoring thread {} for another participant", thread.id);
            return false;
        }
        self.revisions.touch(&thread.id);

        if let Some(pos) = self.items.iter().position(|t| t.id == thread.id) {
            if self.items[pos] == thread {
                return false;
            }
            let old = self.items.remove(pos);
            self.unread_total -= self.unread_of(&old);
        }

        self.unread_total += self.unread_of(&thread);
        self.insert_sorted(thread);
        true
    }

    pub fn remove(&mut self, id: &ThreadId) -> Option<Thread> {
        self.revisions.touch(id);
        let pos = self.items.iter().position(|t| &t.id == id)?;
        let removed = self.items.remove(pos);
        self.unread_total -= self.unread_of(&removed);
        Some(removed)
    }

    /// Moves a thread forward for a message that is newer than its last
    /// activity, bumping the counter of the recipient side. Older or already
    /// counted messages change nothing.
    pub fn touch(&mut self, message: &Message) -> bool {
        let Some(pos) = self.items.iter().position(|t| t.id == message.thread_id) else {
            return false;
        };
        if message.created_at <= self.items[pos].last_activity_at {
            return false;
        }

        self.revisions.touch(&message.thread_id);
        let mut thread = self.items.remove(pos);
        let before = self.unread_of(&thread);
        thread.last_activity_at = message.created_at;
        thread.last_message_preview = Some(message.preview());
        let recipient = message.sender_role.other();
        if !message.is_read_by(recipient) {
            *thread.unread_for_mut(recipient) += 1;
        }
        self.unread_total = self.unread_total - before + self.unread_of(&thread);
        self.insert_sorted(thread);
        true
    }

    /// Sets the bound identity's counter on one thread and returns the
    /// previous value.
    pub fn set_unread(&mut self, id: &ThreadId, count: u32) -> Option<u32> {
        let role = self.identity.as_ref()?.role;
        let thread = self.items.iter_mut().find(|t| &t.id == id)?;
        let previous = thread.unread_for(role);
        *thread.unread_for_mut(role) = count;
        self.revisions.touch(id);
        self.unread_total = self.unread_total - previous + count;
        Some(previous)
    }

    fn insert_sorted(&mut self, thread: Thread) {
        let pos = self
            .items
            .partition_point(|t| latest_first(t, &thread) == Ordering::Less);
        self.items.insert(pos, thread);
    }
}
