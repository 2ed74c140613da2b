//! Tunable background sync parameters.

use rustkit_common::retry::BackoffPolicy;
use rustkit_common::serde_helpers::duration_ms;
use rustkit_common::RustKitError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and delays governing firing and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSyncParameters {
    /// Refuse all work.
    pub disable: bool,

    /// Attempts before a failing registration is dropped.
    pub max_sync_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(with = "duration_ms")]
    pub initial_retry_delay: Duration,

    /// Growth of the retry delay per further failure.
    pub retry_delay_factor: f64,

    /// Upper bound on any single retry delay.
    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,

    /// Longest wait before re-checking while events are in flight.
    #[serde(with = "duration_ms")]
    pub min_sync_recovery_time: Duration,

    /// How long one sync event may run before it counts as failed.
    #[serde(with = "duration_ms")]
    pub max_sync_event_duration: Duration,
}

impl Default for BackgroundSyncParameters {
    fn default() -> Self {
        Self {
            disable: false,
            max_sync_attempts: 3,
            initial_retry_delay: Duration::from_secs(5 * 60),
            retry_delay_factor: 3.0,
            max_retry_delay: Duration::from_secs(7 * 24 * 60 * 60),
            min_sync_recovery_time: Duration::from_secs(6 * 60),
            max_sync_event_duration: Duration::from_secs(3 * 60),
        }
    }
}

impl BackgroundSyncParameters {
    /// Parse parameters from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> rustkit_common::Result<Self> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| RustKitError::config_with_source("invalid background sync parameters", e))?;
        params.validate()?;
        Ok(params)
    }

    /// Reject parameters the manager cannot work with.
    pub fn validate(&self) -> rustkit_common::Result<()> {
        if self.max_sync_attempts == 0 {
            return Err(RustKitError::config("max_sync_attempts must be at least 1"));
        }
        if self.retry_delay_factor.is_nan() || self.retry_delay_factor < 1.0 {
            return Err(RustKitError::config("retry_delay_factor must be at least 1"));
        }
        if self.max_retry_delay < self.initial_retry_delay {
            return Err(RustKitError::config(
                "max_retry_delay must not be below initial_retry_delay",
            ));
        }
        Ok(())
    }

    /// Backoff between attempts of one registration, capped at
    /// `max_retry_delay`.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.initial_retry_delay, self.retry_delay_factor)
            .with_max_delay(self.max_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = BackgroundSyncParameters::from_json("{}").unwrap();
        assert_eq!(params, BackgroundSyncParameters::default());
        assert_eq!(params.max_sync_attempts, 3);
        assert_eq!(params.initial_retry_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let params = BackgroundSyncParameters::from_json(
            r#"{"max_sync_attempts": 5, "initial_retry_delay": 1000, "retry_delay_factor": 2.0}"#,
        )
        .unwrap();
        assert_eq!(params.max_sync_attempts, 5);
        assert_eq!(params.initial_retry_delay, Duration::from_secs(1));
        assert_eq!(params.min_sync_recovery_time, Duration::from_secs(360));
    }

    #[test]
    fn test_invalid() {
        assert!(BackgroundSyncParameters::from_json(r#"{"max_sync_attempts": 0}"#).is_err());
        assert!(BackgroundSyncParameters::from_json(r#"{"retry_delay_factor": 0.5}"#).is_err());
        assert!(BackgroundSyncParameters::from_json("[]").is_err());
        assert!(BackgroundSyncParameters::from_json(
            r#"{"initial_retry_delay": 60000, "max_retry_delay": 1000}"#
        )
        .is_err());
    }

    #[test]
    fn test_validate_struct_literal() {
        let params = BackgroundSyncParameters {
            max_sync_attempts: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        assert!(BackgroundSyncParameters::default().validate().is_ok());
    }

    #[test]
    fn test_backoff_capped_for_many_attempts() {
        let params = BackgroundSyncParameters::from_json(
            r#"{"max_sync_attempts": 100, "retry_delay_factor": 10.0}"#,
        )
        .unwrap();
        let backoff = params.backoff();

        assert_eq!(backoff.delay_for_failures(41), params.max_retry_delay);
        assert_eq!(backoff.delay_for_failures(u32::MAX), params.max_retry_delay);
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let backoff = BackgroundSyncParameters::default().backoff();
        let delays: Vec<_> = (1..=4).map(|k| backoff.delay_for_failures(k)).collect();

        assert_eq!(delays[0], Duration::from_secs(300));
        assert_eq!(delays[1], Duration::from_secs(900));
        assert_eq!(delays[2], Duration::from_secs(2700));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }
}
