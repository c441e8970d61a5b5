//! Parsing of `--at` schedule strings
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: "2025-11-20T15:00:00Z"
//! - durations relative to now: "30m", "2h", "1 hour"
//! - natural language: "tomorrow", "next monday 10am"

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SlotlineError};

/// Parse `input` relative to `now` into a Unix timestamp
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SlotlineError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc).timestamp());
    }

    if let Some(duration) = parse_duration(input) {
        return Ok((now + duration).timestamp());
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map(|dt| dt.timestamp())
        .map_err(|e| {
            SlotlineError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
        })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::try_seconds(i64::try_from(std_duration.as_secs()).ok()?)
}
