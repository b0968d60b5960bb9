use std::time::Duration;

use chrono::{DateTime, Local};

/// Formats the current local time with a strftime pattern.
pub fn format_local_now(strftime: &str) -> String {
    format_local(Local::now(), strftime)
}

pub fn format_local(time: DateTime<Local>, strftime: &str) -> String {
    time.format(strftime).to_string()
}

/// Elapsed time as `XhYm`, minutes are rounded up.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600).div_ceil(60);
    format!("{hours}h{minutes}m")
}

#[cfg(not(test))]
pub fn now_unix() -> f64 {
    real_now_unix()
}

#[cfg(test)]
pub use mock_time::now_unix;

fn real_now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}
