use chrono::Utc;
use std::time::Duration;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Duration as whole milliseconds, saturating on overflow.
pub(crate) fn to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
