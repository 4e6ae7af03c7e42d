//! Formatting utilities for operator-facing output.

use chrono::{DateTime, Utc};

/// Render a millisecond duration as a compact human string.
pub fn format_duration(ms: i64) -> String {
    if ms < 1_000 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1_000;
    if secs < 60 {
        return format!("{}s", secs);
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m{}s", mins, secs % 60);
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{}h{}m", hours, mins % 60);
    }
    format!("{}d{}h", hours / 24, hours % 24)
}

/// Render a timestamp relative to now ("3m ago", "2h ago").
pub fn format_relative(at: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(at);
    let secs = elapsed.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{}s ago", secs);
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m ago", mins);
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{}h ago", hours);
    }
    format!("{}d ago", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(5_000), "5s");
        assert_eq!(format_duration(90_000), "1m30s");
        assert_eq!(format_duration(3_900_000), "1h5m");
        assert_eq!(format_duration(90_000_000), "1d1h");
    }

    #[test]
    fn test_format_relative() {
        let recent = Utc::now() - Duration::seconds(30);
        assert_eq!(format_relative(recent), "30s ago");
        let older = Utc::now() - Duration::minutes(5);
        assert_eq!(format_relative(older), "5m ago");
    }
}
