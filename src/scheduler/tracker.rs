//! In-memory set of job ids currently claimed by the engine.
//!
//! Poller queries exclude tracked ids so a job is never dispatched twice
//! concurrently. Losing the tracker is not catastrophic: the worst outcome is
//! a duplicate dispatch, which the download pipeline's idempotent persistence
//! absorbs.

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: DashMap<i64, ()>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job_id: i64) {
        self.jobs.insert(job_id, ());
    }

    pub fn remove(&self, job_id: i64) {
        self.jobs.remove(&job_id);
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.jobs.contains_key(&job_id)
    }

    /// Point-in-time copy of the tracked ids, safe to iterate while other
    /// tasks keep mutating the set.
    pub fn snapshot(&self) -> Vec<i64> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
