//! Utility helpers for promtsdb.

use std::process::Command;

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Machine hostname via the `hostname` command.
///
/// Returns `None` if the command fails or prints nothing.
pub fn hostname() -> Option<String> {
    Command::new("hostname")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
