//! Configuration for the sink and heartbeats.

use crate::error::{EngineError, EngineResult};
use regsync_model::Options;
use std::time::Duration;

/// Job option overriding the reconcile interval, in milliseconds.
pub const RECONCILE_INTERVAL_OPTION: &str = "reconcile_interval_ms";

/// Configuration for a [`LocalSink`](crate::LocalSink).
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Time between two full reconciliation ticks.
    pub reconcile_interval: Duration,
}

impl SinkConfig {
    /// Creates a sink configuration.
    pub fn new(reconcile_interval: Duration) -> Self {
        Self { reconcile_interval }
    }

    /// Sets the reconcile interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Applies per-job overrides from `job_options`.
    pub fn with_options(self, options: &Options) -> EngineResult<Self> {
        match options.get(RECONCILE_INTERVAL_OPTION) {
            Some(raw) => {
                let millis = parse_millis(RECONCILE_INTERVAL_OPTION, raw)?;
                Ok(self.with_reconcile_interval(millis))
            }
            None => Ok(self),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Configuration for a [`HeartbeatKeeper`](crate::HeartbeatKeeper).
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Delay before the first beat.
    pub initial_delay: Duration,
    /// Time between beats.
    pub period: Duration,
}

impl HeartbeatConfig {
    /// Creates a heartbeat configuration.
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(5))
    }
}

/// Parses a positive millisecond count from a plugin option.
pub(crate) fn parse_millis(key: &str, raw: &str) -> EngineResult<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Duration::from_millis(millis)),
        _ => Err(EngineError::InvalidOption {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(SinkConfig::default().reconcile_interval, Duration::from_secs(30));
        let heartbeat = HeartbeatConfig::default();
        assert_eq!(heartbeat.initial_delay, Duration::from_secs(3));
        assert_eq!(heartbeat.period, Duration::from_secs(5));
    }

    #[test]
    fn job_option_overrides_interval() {
        let mut options = Options::new();
        options.insert(RECONCILE_INTERVAL_OPTION.into(), "250".into());
        let config = SinkConfig::default().with_options(&options).unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_millis(250));
    }

    #[test]
    fn bad_interval_rejected() {
        for raw in ["0", "-5", "soon"] {
            let mut options = Options::new();
            options.insert(RECONCILE_INTERVAL_OPTION.into(), raw.into());
            assert!(matches!(
                SinkConfig::default().with_options(&options),
                Err(EngineError::InvalidOption { .. })
            ));
        }
    }
}
