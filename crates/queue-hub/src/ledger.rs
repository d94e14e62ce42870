//! Bounded record of finished jobs.
//!
//! Keeps the outcome of completed and failed jobs after their stored record
//! is gone, so status queries and waiters still see how the job ended.

use crate::job::{JobId, JobRecord, JobState};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Default number of outcomes retained per transport.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Outcome {
    record: JobRecord,
    /// Whether the job should still appear in listings and counts.
    listed: bool,
}

#[derive(Debug, Default)]
struct LedgerInner {
    outcomes: HashMap<JobId, Outcome>,
    order: VecDeque<JobId>,
}

/// Terminal outcomes keyed by job id, oldest evicted first.
#[derive(Debug)]
pub struct OutcomeLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl Default for OutcomeLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl OutcomeLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Records a terminal outcome. `listed = false` keeps it as a tombstone.
    pub fn record(&self, record: JobRecord, listed: bool) {
        let mut inner = self.inner.lock();
        let id = record.id.clone();
        if inner
            .outcomes
            .insert(id.clone(), Outcome { record, listed })
            .is_none()
        {
            inner.order.push_back(id);
        }

        while inner.outcomes.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.outcomes.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Outcome of `id`, listed or not.
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.inner.lock().outcomes.get(id).map(|o| o.record.clone())
    }

    /// Outcome of `id` only if it is still listed.
    pub fn get_listed(&self, id: &JobId) -> Option<JobRecord> {
        self.inner
            .lock()
            .outcomes
            .get(id)
            .filter(|o| o.listed)
            .map(|o| o.record.clone())
    }

    /// Drops the outcome of `id`.
    pub fn forget(&self, id: &JobId) -> Option<JobRecord> {
        let mut inner = self.inner.lock();
        let removed = inner.outcomes.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(removed.record)
    }

    /// Listed outcomes in any of `states`, oldest first.
    pub fn listed(&self, states: &[JobState]) -> Vec<JobRecord> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.outcomes.get(id))
            .filter(|o| o.listed && (states.is_empty() || states.contains(&o.record.state)))
            .map(|o| o.record.clone())
            .collect()
    }

    /// Removes listed outcomes matching `predicate`, up to `limit` (0 = all).
    pub fn drain_where<F>(&self, limit: usize, mut predicate: F) -> Vec<JobRecord>
    where
        F: FnMut(&JobRecord) -> bool,
    {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        let ids: Vec<JobId> = inner.order.iter().cloned().collect();

        for id in ids {
            if limit > 0 && drained.len() >= limit {
                break;
            }
            let matches = inner
                .outcomes
                .get(&id)
                .is_some_and(|o| o.listed && predicate(&o.record));
            if matches {
                if let Some(outcome) = inner.outcomes.remove(&id) {
                    drained.push(outcome.record);
                }
            }
        }

        let LedgerInner { outcomes, order } = &mut *inner;
        order.retain(|id| outcomes.contains_key(id));
        drained
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.outcomes.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
