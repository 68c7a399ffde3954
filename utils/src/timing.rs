// Timekeeping helpers for the logging infrastructure
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the number of milliseconds since the unix epoch. Used to
/// timestamp log entries.
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch")
        .as_millis() as u64
}
