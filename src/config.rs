use std::time::Duration;

use crate::model::{Ms, HOUR_MS, MINUTE_MS};

/// Tunable thresholds for cancellation policy and sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long past its start a scheduled lesson may sit before it is marked not started.
    pub not_started_grace_ms: Ms,
    /// How long a meeting room must be empty before its lesson is auto-completed.
    pub empty_room_threshold_ms: Ms,
    /// Ceiling on meeting length before a forced completion.
    pub max_meeting_duration_ms: Ms,
    /// Student cancellations at least this far ahead of the start get their hours back.
    pub free_cancellation_window_ms: Ms,
    /// How early before the start a tutor may open the meeting.
    pub meeting_early_start_ms: Ms,
    pub sweep_interval: Duration,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            not_started_grace_ms: 15 * MINUTE_MS,
            empty_room_threshold_ms: 10 * MINUTE_MS,
            max_meeting_duration_ms: 80 * MINUTE_MS,
            free_cancellation_window_ms: 12 * HOUR_MS,
            meeting_early_start_ms: 10 * MINUTE_MS,
            sweep_interval: Duration::from_secs(60),
            compact_threshold: 1000,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LESSOND_*` variables. Unparseable values fall back silently.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let minutes = |key: &str, default: Ms| {
            lookup(key)
                .and_then(|s| s.parse::<Ms>().ok())
                .map_or(default, |m| m * MINUTE_MS)
        };
        Self {
            not_started_grace_ms: minutes(
                "LESSOND_NOT_STARTED_GRACE_MINUTES",
                defaults.not_started_grace_ms,
            ),
            empty_room_threshold_ms: minutes(
                "LESSOND_EMPTY_ROOM_THRESHOLD_MINUTES",
                defaults.empty_room_threshold_ms,
            ),
            max_meeting_duration_ms: minutes(
                "LESSOND_MAX_MEETING_MINUTES",
                defaults.max_meeting_duration_ms,
            ),
            free_cancellation_window_ms: minutes(
                "LESSOND_FREE_CANCELLATION_MINUTES",
                defaults.free_cancellation_window_ms,
            ),
            meeting_early_start_ms: minutes(
                "LESSOND_MEETING_EARLY_START_MINUTES",
                defaults.meeting_early_start_ms,
            ),
            sweep_interval: lookup("LESSOND_SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .map_or(defaults.sweep_interval, Duration::from_secs),
            compact_threshold: lookup("LESSOND_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_policy() {
        let c = EngineConfig::default();
        assert_eq!(c.not_started_grace_ms, 15 * MINUTE_MS);
        assert_eq!(c.empty_room_threshold_ms, 10 * MINUTE_MS);
        assert_eq!(c.max_meeting_duration_ms, 80 * MINUTE_MS);
        assert_eq!(c.free_cancellation_window_ms, 12 * HOUR_MS);
    }

    #[test]
    fn overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("LESSOND_FREE_CANCELLATION_MINUTES", "1440"),
            ("LESSOND_SWEEP_INTERVAL_SECS", "5"),
            ("LESSOND_MAX_MEETING_MINUTES", "ninety"),
        ]
        .into_iter()
        .collect();
        let c = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.free_cancellation_window_ms, 24 * HOUR_MS);
        assert_eq!(c.sweep_interval, Duration::from_secs(5));
        assert_eq!(c.max_meeting_duration_ms, 80 * MINUTE_MS);
    }
}
