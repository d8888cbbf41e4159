use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix milliseconds.
///
/// Signed so that ages computed against tag timestamps written by other
/// instances (possibly with a skewed clock) can go negative instead of
/// wrapping.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
