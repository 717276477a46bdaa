//! Conversions between oplog timestamps and wall clock time.

use std::time::{Duration, UNIX_EPOCH};

use bson::Timestamp;
use chrono::{DateTime, Local, TimeZone, Utc};

/// Wall clock time of an oplog timestamp, for logging.
pub fn to_datetime(ts: &Timestamp) -> DateTime<Local> {
    Local
        .timestamp_opt(ts.time as i64, 0)
        .single()
        .unwrap_or_else(|| DateTime::from(UNIX_EPOCH + Duration::from_secs(ts.time as u64)))
}

/// The first possible oplog timestamp `seconds` ago.
pub fn seconds_ago(seconds: u32) -> Timestamp {
    let now = Utc::now().timestamp().max(0) as u32;
    Timestamp {
        time: now.saturating_sub(seconds),
        increment: 0,
    }
}
