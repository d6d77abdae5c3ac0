use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01), truncated
/// to 32 bits the way every TSK timestamp field on the wire is.
#[inline]
pub fn timestamp_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as u32
}
