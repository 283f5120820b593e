//! Formatted output helpers for CLI commands.

use chrono::TimeDelta;

/// Shortens `value` to at most `width` characters, marking the cut with `…`.
#[must_use]
pub fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Renders an elapsed duration the way `ps` does (e.g. "5 minutes ago").
#[must_use]
pub fn format_age(elapsed: TimeDelta) -> String {
    let secs = elapsed.num_seconds();
    let (count, unit) = match secs {
        i64::MIN..=0 => return "Less than a second ago".into(),
        1..=59 => (secs, "second"),
        60..=3599 => (secs / 60, "minute"),
        3600..=86_399 => (secs / 3600, "hour"),
        _ => (secs / 86_400, "day"),
    };
    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}

/// Quotes a command line for display.
#[must_use]
pub fn format_command(path: &str, args: &[String]) -> String {
    let mut command = path.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    format!("\"{command}\"")
}
