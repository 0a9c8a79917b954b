use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_epoch_secs_u64() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

pub fn now_epoch_secs_i64() -> i64 {
    i64::try_from(now_epoch_secs_u64()).unwrap_or(0)
}

/// Fractional-second epoch time, used by the announce/path-request grace and
/// jitter windows (§4.5, §4.6) which are specified in sub-second units.
pub fn now_epoch_secs_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
