//! Staggered worker selection
//!
//! Always loading the worker with the highest lifetime count concentrates
//! retirements onto one worker at a time. Workers are kept below
//! `max_lifetime - margin` while any such worker exists, so only one of them
//! is pushed to the limit deliberately. `margin` shrinks as the fleet grows.
//!
//! The Redis selection script mirrors this module; keep both in step.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SelectionLimits;
use crate::persistence::{WorkerSnapshot, WorkerStatus};

/// Buffer below the lifetime limit for a fleet of `worker_count` workers
pub fn margin(max_lifetime: u32, worker_count: usize) -> u32 {
    if worker_count == 0 {
        return 1;
    }
    let count = u32::try_from(worker_count).unwrap_or(u32::MAX);
    (max_lifetime / count).max(1)
}

/// Whether the worker may take one more session right now
pub fn is_candidate(
    worker: &WorkerSnapshot,
    limits: &SelectionLimits,
    liveness_window: Duration,
    now: DateTime<Utc>,
) -> bool {
    if worker.record.status != WorkerStatus::Available {
        return false;
    }
    if !is_live(worker.record.last_heartbeat, liveness_window, now) {
        return false;
    }
    worker.active < limits.max_concurrent && worker.lifetime < limits.max_lifetime
}

/// Heartbeat age check; a heartbeat from the future counts as fresh
pub fn is_live(last_heartbeat: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    match (now - last_heartbeat).to_std() {
        Ok(age) => age <= window,
        Err(_) => true,
    }
}

/// Preference order: highest lifetime, then lowest active, then lowest id
pub fn preference(a: &WorkerSnapshot, b: &WorkerSnapshot) -> Ordering {
    b.lifetime
        .cmp(&a.lifetime)
        .then(a.active.cmp(&b.active))
        .then_with(|| a.record.key.id().cmp(b.record.key.id()))
}

/// Pick the worker that should receive the next session
///
/// `workers` must hold every existing record for one capability, not only
/// the candidates, because the margin is derived from the fleet size.
/// Runs in a single pass over the slice.
pub fn choose<'a>(
    workers: &'a [WorkerSnapshot],
    limits: &SelectionLimits,
    liveness_window: Duration,
    now: DateTime<Utc>,
) -> Option<&'a WorkerSnapshot> {
    let margin = margin(limits.max_lifetime, workers.len());
    let primary_ceiling = limits.max_lifetime.saturating_sub(margin);

    let mut primary: Option<&WorkerSnapshot> = None;
    let mut fallback: Option<&WorkerSnapshot> = None;

    for worker in workers {
        if !is_candidate(worker, limits, liveness_window, now) {
            continue;
        }

        if worker.lifetime < primary_ceiling {
            primary = Some(better(primary, worker));
        } else if worker.lifetime + 1 <= limits.max_lifetime {
            fallback = Some(better(fallback, worker));
        }
    }

    primary.or(fallback)
}

fn better<'a>(current: Option<&'a WorkerSnapshot>, other: &'a WorkerSnapshot) -> &'a WorkerSnapshot {
    match current {
        Some(current) if preference(current, other) != Ordering::Greater => current,
        _ => other,
    }
}
