//! Fleet protocol module: liveness, command queue rules, check-in handling.

mod checkin;
mod commands;

pub use checkin::*;
pub use commands::*;

use chrono::{DateTime, Duration, Utc};

/// A device unseen for this long counts as offline.
pub const ONLINE_THRESHOLD_SECS: i64 = 300;

/// Authoritative liveness check. The cached `status` column is only a
/// display hint; reads always recompute from `last_seen`.
pub fn is_online(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_seen) < Duration::seconds(ONLINE_THRESHOLD_SECS)
}

/// The `last_seen` cutoff separating online from offline devices at `now`.
pub fn offline_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(ONLINE_THRESHOLD_SECS)
}
