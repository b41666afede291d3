use std::time::Duration;

use crate::units::Bitrate;
use crate::Error;

/// Tuning knobs for the estimation and pacing pipeline.
///
/// The defaults are the documented GCC values; constructing a [`crate::Session`]
/// validates the combination and fails with [`Error::InvalidConfig`] on
/// nonsense.
///
/// ```
/// use paceline::{Bitrate, Config};
///
/// let config = Config {
///     initial_bitrate: Bitrate::kbps(300),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Target bitrate before any feedback has been processed.
    pub initial_bitrate: Bitrate,
    /// Lower bound for the published target.
    pub min_bitrate: Bitrate,
    /// Upper bound for the published target.
    pub max_bitrate: Bitrate,

    /// Packets sent within this interval of the first packet form one
    /// arrival group.
    pub burst_interval: Duration,
    /// A group never spans more arrival time than this.
    pub max_burst_duration: Duration,

    /// Process noise of the delay gradient Kalman filter.
    pub kalman_process_noise: f64,
    /// The delay estimate must stay above the threshold this long before
    /// overuse is signaled.
    pub overuse_time_threshold: Duration,
    /// Adaptation gain of the overuse threshold when the estimate is above
    /// it.
    pub threshold_k_up: f64,
    /// Adaptation gain when the estimate is below it.
    pub threshold_k_down: f64,
    /// Bounds for the adaptive threshold (ms).
    pub threshold_bounds_ms: (f64, f64),

    /// Backoff factor applied to the delivered rate on overuse.
    pub beta: f64,

    /// Pacer tick interval.
    pub pacer_step: Duration,
    /// The pacer bucket holds at most this much sending time worth of
    /// tokens.
    pub pacer_window: Duration,

    /// How often the bitrate allocator applies the current target.
    pub allocator_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_bitrate: Bitrate::bps(100_000),
            min_bitrate: Bitrate::bps(50_000),
            max_bitrate: Bitrate::bps(50_000_000),
            burst_interval: Duration::from_millis(5),
            max_burst_duration: Duration::from_millis(100),
            kalman_process_noise: 1e-3,
            overuse_time_threshold: Duration::from_millis(10),
            threshold_k_up: 0.01,
            threshold_k_down: 0.00018,
            threshold_bounds_ms: (6.0, 600.0),
            beta: 0.85,
            pacer_step: Duration::from_millis(5),
            pacer_window: Duration::from_millis(500),
            allocator_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_bitrate > self.max_bitrate {
            return Err(Error::InvalidConfig(format!(
                "min_bitrate {} above max_bitrate {}",
                self.min_bitrate, self.max_bitrate
            )));
        }
        if self.min_bitrate <= Bitrate::ZERO {
            return Err(Error::InvalidConfig("min_bitrate must be positive".into()));
        }
        if self.initial_bitrate < self.min_bitrate || self.initial_bitrate > self.max_bitrate {
            return Err(Error::InvalidConfig(format!(
                "initial_bitrate {} outside [{}, {}]",
                self.initial_bitrate, self.min_bitrate, self.max_bitrate
            )));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(Error::InvalidConfig(format!("beta {} outside [0, 1]", self.beta)));
        }
        if self.pacer_step.is_zero() || self.pacer_window.is_zero() {
            return Err(Error::InvalidConfig(
                "pacer step and window must be non-zero".into(),
            ));
        }
        if self.allocator_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "allocator interval must be non-zero".into(),
            ));
        }
        if self.threshold_bounds_ms.0 > self.threshold_bounds_ms.1 {
            return Err(Error::InvalidConfig(
                "threshold bounds must be ordered".into(),
            ));
        }

        Ok(())
    }
}
