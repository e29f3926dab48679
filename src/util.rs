use once_cell::sync::Lazy;
use std::time::Instant;

// Epoch anchor captured once at process start; all later reads advance it
// with the monotonic clock so durations are immune to wall-clock jumps.
static CLOCK_ANCHOR: Lazy<(i64, Instant)> =
    Lazy::new(|| (chrono::Utc::now().timestamp_millis(), Instant::now()));

/// Monotonic epoch-milliseconds timestamp.
pub fn now_ms() -> i64 {
    CLOCK_ANCHOR.0 + CLOCK_ANCHOR.1.elapsed().as_millis() as i64
}

/// Render a millisecond age for humans: `"-"` for unknown, then the two
/// most significant units (`"42s"`, `"3m 10s"`, `"2h 05m"`, `"1d 3h"`).
pub fn format_age(age_ms: i64) -> String {
    if age_ms < 0 {
        return "-".to_string();
    }
    let secs = age_ms / 1000;
    if secs < 60 {
        return format!("{secs}s");
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m {:02}s", mins, secs % 60);
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{}h {:02}m", hours, mins % 60);
    }
    format!("{}d {}h", hours / 24, hours % 24)
}
