use std::collections::HashMap;
use std::hash::Hash;

/// Records which keys of a local collection changed and at what revision, so
/// that a snapshot fetched before those changes does not overwrite them.
///
/// Callers read [`current`](Self::current) before starting a fetch and pass it
/// back as `since` when the snapshot arrives.
#[derive(Debug)]
pub struct Revisions<K> {
    current: u64,
    touched: HashMap<K, u64>,
    applied_since: u64,
}

impl<K> Default for Revisions<K> {
    fn default() -> Self {
        Self {
            current: 0,
            touched: HashMap::new(),
            applied_since: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> Revisions<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Marks `key` as changed locally, including removals.
    pub fn touch(&mut self, key: &K) {
        self.current += 1;
        self.touched.insert(key.clone(), self.current);
    }

    pub fn changed_since(&self, key: &K, since: u64) -> bool {
        self.touched.get(key).is_some_and(|at| *at > since)
    }

    /// False when a snapshot started later than `since` was already applied.
    pub fn accepts_snapshot(&self, since: u64) -> bool {
        since >= self.applied_since
    }

    /// Forgets changes the applied snapshot already covers.
    pub fn snapshot_applied(&mut self, since: u64) {
        self.applied_since = since;
        self.touched.retain(|_, at| *at > since);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_after_snapshot_start_are_reported() {
        let mut r: Revisions<&str> = Revisions::new();
        r.touch(&"a");
        let since = r.current();
        r.touch(&"b");

        assert!(!r.changed_since(&"a", since));
        assert!(r.changed_since(&"b", since));
        assert!(!r.changed_since(&"c", since));
    }

    #[test]
    fn test_older_snapshot_is_refused_after_newer_one() {
        let mut r: Revisions<&str> = Revisions::new();
        let early = r.current();
        r.touch(&"a");
        let late = r.current();

        assert!(r.accepts_snapshot(late));
        r.snapshot_applied(late);
        assert!(!r.accepts_snapshot(early));
    }
}
