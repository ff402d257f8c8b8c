//! Short-lived job status cache.
//!
//! Only non-terminal snapshots are stored. A terminal reading always comes
//! from a fresh fetch, so it reaches the caller exactly once.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::JobStatusSnapshot;

/// Status snapshots keyed by job id, valid for `ttl` after `fetched_at`.
#[derive(Debug)]
pub struct StatusCache {
    entries: Mutex<HashMap<String, JobStatusSnapshot>>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a fresh snapshot, evicting it if it has expired.
    pub fn get(&self, job_id: &str) -> Option<JobStatusSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get(job_id) {
            Some(snap) if snap.fetched_at.elapsed() < self.ttl => Some(snap.clone()),
            Some(_) => {
                entries.remove(job_id);
                None
            }
            None => None,
        }
    }

    /// Stores a non-terminal snapshot. A terminal one evicts the entry instead.
    ///
    /// Expired entries of other jobs are dropped on the way.
    pub fn insert(&self, snap: &JobStatusSnapshot) {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        entries.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
        if snap.state.is_terminal() {
            entries.remove(&snap.job_id);
        } else {
            entries.insert(snap.job_id.clone(), snap.clone());
        }
    }

    pub fn invalidate(&self, job_id: &str) {
        self.entries.lock().remove(job_id);
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .retain(|_, snap| snap.fetched_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = StatusCache::new(Duration::from_secs(2));
        cache.insert(&JobStatusSnapshot::new("a", JobState::Active, 10));

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert_eq!(cache.get("a").map(|s| s.progress), Some(10));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn terminal_snapshots_are_never_cached() {
        let cache = StatusCache::new(Duration::from_secs(2));
        cache.insert(&JobStatusSnapshot::new("a", JobState::Active, 90));
        cache.insert(&JobStatusSnapshot::new("a", JobState::Completed, 100));

        assert!(cache.get("a").is_none());

        cache.insert(&JobStatusSnapshot::new("b", JobState::Failed, 0));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_live_entries() {
        let cache = StatusCache::new(Duration::from_secs(2));
        cache.insert(&JobStatusSnapshot::new("old", JobState::Waiting, 0));
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.insert(&JobStatusSnapshot::new("new", JobState::Active, 5));

        cache.purge_expired();

        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_drops_expired_entries_of_other_jobs() {
        let cache = StatusCache::new(Duration::from_secs(2));
        cache.insert(&JobStatusSnapshot::new("abandoned", JobState::Active, 40));
        tokio::time::advance(Duration::from_secs(5)).await;

        cache.insert(&JobStatusSnapshot::new("live", JobState::Active, 10));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("live").is_some());
    }
}
