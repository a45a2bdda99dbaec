//! Identifier aliases shared across the crate.

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Opaque identifier of an authenticated user, resolved by the upstream identity layer.
pub type UserId = String;
pub type JobId = Uuid;
pub type EntryId = Uuid;
pub type TransactionId = Uuid;
pub type SubscriptionId = Uuid;

/// Short form of a UUID for log lines.
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// `at + duration`, saturating at the largest representable instant.
pub fn time_after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, saturating at the smallest representable instant.
pub fn time_before(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
