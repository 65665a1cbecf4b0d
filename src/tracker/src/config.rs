use std::time::Duration;

/// Tracker server configuration. Defaults match the reference cadence:
/// a 1.5s heartbeat, ~30s to flag a silent peer `down`, 20 minutes to
/// purge it permanently.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Heartbeat tick interval.
    pub broadcast_period: Duration,
    /// Force an empty heartbeat after this many quiet ticks, so peers don't
    /// mistake a quiet-but-alive replica for a dead one.
    pub max_silent_periods: u32,
    /// Silence before a peer is flagged `down`.
    pub down_period: Duration,
    /// Silence before a peer is flagged `permdown`.
    pub permdown_period: Duration,
    /// Heartbeat ticks to accumulate pending clocks before requesting transfers.
    pub clock_sample_periods: u32,
    /// Diagnostic verbosity for this tracker's `tracing` spans/events.
    pub log_level: tracing::Level,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let broadcast_period = Duration::from_millis(1500);
        let max_silent_periods = 10;
        Self {
            down_period: broadcast_period * max_silent_periods * 2,
            permdown_period: Duration::from_millis(1_200_000),
            clock_sample_periods: 2,
            log_level: tracing::Level::WARN,
            broadcast_period,
            max_silent_periods,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("down_period ({down_period:?}) must be less than permdown_period ({permdown_period:?})")]
    DownNotBeforePermdown {
        down_period: Duration,
        permdown_period: Duration,
    },
    #[error("max_silent_periods must be at least 1, got {0}")]
    ZeroSilentPeriods(u32),
    #[error("clock_sample_periods must be at least 1, got {0}")]
    ZeroClockSamplePeriods(u32),
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.down_period >= self.permdown_period {
            return Err(ConfigError::DownNotBeforePermdown {
                down_period: self.down_period,
                permdown_period: self.permdown_period,
            });
        }
        if self.max_silent_periods < 1 {
            return Err(ConfigError::ZeroSilentPeriods(self.max_silent_periods));
        }
        if self.clock_sample_periods < 1 {
            return Err(ConfigError::ZeroClockSamplePeriods(self.clock_sample_periods));
        }
        Ok(())
    }
}
