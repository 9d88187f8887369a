use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::{QueueEntry, QueueStatus, TriageCode};

pub const DEFAULT_MINUTES_PER_PATIENT: u32 = 15;

/// Queue priority for a triage code; lower is served sooner.
pub fn priority_for(code: TriageCode) -> i16 {
    match code {
        TriageCode::Red => 1,
        TriageCode::Yellow => 2,
        TriageCode::Green => 3,
    }
}

pub fn triage_for_priority(priority: i16) -> TriageCode {
    match priority {
        1 => TriageCode::Red,
        3 => TriageCode::Green,
        _ => TriageCode::Yellow,
    }
}

/// Ordering key for waiting entries: (priority, created_at, arrival_seq).
pub fn rank_key(entry: &QueueEntry) -> (i16, DateTime<Utc>, i64) {
    (entry.priority, entry.created_at, entry.arrival_seq)
}

pub fn compare_rank(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    rank_key(a).cmp(&rank_key(b))
}

/// True when `other` is served before `target`.
pub fn precedes(other: &QueueEntry, target: &QueueEntry) -> bool {
    compare_rank(other, target) == Ordering::Less
}

/// Number of waiting entries in the target's hospital that are served first.
pub fn count_waiting_ahead<'a>(
    target: &QueueEntry,
    entries: impl IntoIterator<Item = &'a QueueEntry>,
) -> u64 {
    entries
        .into_iter()
        .filter(|other| {
            other.id != target.id
                && other.hospital_id == target.hospital_id
                && other.status == QueueStatus::Waiting
                && precedes(other, target)
        })
        .count() as u64
}

pub fn position_from_ahead(ahead: u64) -> u32 {
    u32::try_from(ahead.saturating_add(1)).unwrap_or(u32::MAX)
}

pub fn estimate_wait_minutes(position: u32, minutes_per_patient: u32) -> u32 {
    position.saturating_sub(1).saturating_mul(minutes_per_patient)
}

pub fn sort_by_rank(entries: &mut [QueueEntry]) {
    entries.sort_by(compare_rank);
}
