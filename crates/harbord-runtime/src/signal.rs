//! Signal name parsing for stop and kill requests.

use std::str::FromStr;

use harbord_common::error::{HarbordError, Result};
pub use nix::sys::signal::Signal;

/// Parses a signal given by name (`SIGTERM`, `TERM`, `term`) or number (`15`).
///
/// # Errors
///
/// Returns `InvalidParameter` if the value names no known signal.
pub fn parse_signal(value: &str) -> Result<Signal> {
    let value = value.trim();
    if value.is_empty() {
        return Err(HarbordError::invalid("signal must not be empty"));
    }
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| HarbordError::invalid(format!("invalid signal: {value}")));
    }
    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| HarbordError::invalid(format!("invalid signal: {value}")))
}

/// Resolves a configured stop signal, falling back to `SIGTERM` when it is
/// unset or unparseable.
#[must_use]
pub fn stop_signal_or_default(configured: &str) -> Signal {
    if configured.is_empty() {
        return Signal::SIGTERM;
    }
    parse_signal(configured).unwrap_or_else(|e| {
        tracing::warn!(signal = configured, error = %e, "invalid stop signal, using SIGTERM");
        Signal::SIGTERM
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGUSR1").unwrap(), Signal::SIGUSR1);
    }

    #[test]
    fn rejects_unknown_signals() {
        for bad in ["", "SIGNOPE", "0", "999"] {
            assert!(parse_signal(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn stop_signal_falls_back_to_term() {
        assert_eq!(stop_signal_or_default(""), Signal::SIGTERM);
        assert_eq!(stop_signal_or_default("bogus"), Signal::SIGTERM);
        assert_eq!(stop_signal_or_default("SIGINT"), Signal::SIGINT);
    }
}
