//! Small time helpers shared by selection and binding logic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Nanosecond component of the current time, used as the tie-break source
/// for pool-random selection (`time.Now().UnixNano() % len(pool)`).
pub fn now_nanos_subsec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
}
