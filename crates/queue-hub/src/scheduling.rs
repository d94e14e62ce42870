//! Readiness filtering, execution ordering and batch selection.

use crate::job::JobRecord;
use crate::options::StoredJobOptions;
use std::cmp::Ordering;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Execution order of two jobs.
///
/// Priority ascending, unset last. Ties: two LIFO jobs newest first, a LIFO
/// job before a non-LIFO one, otherwise oldest first.
pub fn compare_for_execution(a: &StoredJobOptions, b: &StoredJobOptions) -> Ordering {
    a.priority_rank()
        .cmp(&b.priority_rank())
        .then_with(|| match (a.is_lifo(), b.is_lifo()) {
            (true, true) => b.created_at().cmp(&a.created_at()),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.created_at().cmp(&b.created_at()),
        })
}

/// Sorts candidates into execution order.
///
/// Jobs created in the same millisecond fall back to fetch order, reversed
/// for LIFO pairs.
pub fn order_for_execution(records: Vec<JobRecord>) -> Vec<JobRecord> {
    let mut indexed: Vec<(usize, JobRecord)> = records.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        compare_for_execution(&a.opts, &b.opts).then_with(|| {
            if a.opts.is_lifo() && b.opts.is_lifo() {
                ib.cmp(ia)
            } else {
                ia.cmp(ib)
            }
        })
    });
    indexed.into_iter().map(|(_, record)| record).collect()
}

/// Outcome of planning one poll tick.
#[derive(Debug, Default)]
pub struct TickPlan {
    /// Jobs to run this tick, in start order.
    pub selected: Vec<JobRecord>,
    /// Fetched jobs not run this tick.
    pub deferred: Vec<JobRecord>,
}

/// Filters to ready jobs, orders them and takes up to `concurrency`.
pub fn plan_tick(candidates: Vec<JobRecord>, now_ms: i64, concurrency: usize) -> TickPlan {
    let (ready, mut deferred): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|record| record.opts.is_ready_at(now_ms));

    let mut ordered = order_for_execution(ready);
    let overflow = ordered.split_off(concurrency.min(ordered.len()));
    deferred.extend(overflow);

    TickPlan {
        selected: ordered,
        deferred,
    }
}
