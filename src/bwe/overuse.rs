use std::fmt;
use std::time::{Duration, Instant};

use crate::Config;

/// Threshold adaptation ignores samples farther above the threshold than
/// this, so a sudden capacity drop doesn't inflate it.
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
/// Threshold adaptation time delta is capped (ms).
const MAX_ADAPT_TIME_DELTA_MS: f64 = 100.0;
/// Initial adaptive threshold (ms).
const INITIAL_THRESHOLD_MS: f64 = 12.5;

/// Bandwidth usage verdict of the overuse detector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Under,
    #[default]
    Normal,
    Over,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usage::Over => write!(f, "overuse"),
            Usage::Under => write!(f, "underuse"),
            Usage::Normal => write!(f, "normal"),
        }
    }
}

/// Compares the delay gradient estimate against an adaptive threshold.
///
/// The threshold drifts towards the absolute estimate, quickly upwards and
/// slowly back down, which keeps the detector robust against delay patterns
/// that would otherwise flip it constantly (and against starving alongside
/// concurrent TCP flows).
#[derive(Debug)]
pub(crate) struct OveruseDetector {
    threshold_ms: f64,
    k_up: f64,
    k_down: f64,
    bounds_ms: (f64, f64),
    overuse_time_threshold: Duration,
    /// Clock of the last threshold adaptation (arrival time base).
    last_update: Option<Instant>,
    /// When the estimate first exceeded the threshold.
    overusing_since: Option<Instant>,
    /// Consecutive over-threshold observations.
    overuse_count: usize,
    prev_estimate: f64,
    usage: Usage,
}

impl OveruseDetector {
    pub fn new(config: &Config) -> Self {
        OveruseDetector {
            threshold_ms: INITIAL_THRESHOLD_MS,
            k_up: config.threshold_k_up,
            k_down: config.threshold_k_down,
            bounds_ms: config.threshold_bounds_ms,
            overuse_time_threshold: config.overuse_time_threshold,
            last_update: None,
            overusing_since: None,
            overuse_count: 0,
            prev_estimate: 0.0,
            usage: Usage::Normal,
        }
    }

    /// Feed a new delay gradient estimate.
    ///
    /// `arrival` is the remote receive time of the ack that produced the
    /// estimate; detection timing runs on the arrival clock.
    pub fn update(&mut self, arrival: Instant, estimate_ms: f64, num_samples: usize) -> Usage {
        self.usage = self.detect(arrival, estimate_ms, num_samples);
        self.adapt_threshold(arrival, estimate_ms);
        self.prev_estimate = estimate_ms;

        self.usage
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn threshold_ms(&self) -> f64 {
        self.threshold_ms
    }

    fn detect(&mut self, arrival: Instant, estimate_ms: f64, num_samples: usize) -> Usage {
        if num_samples < 2 {
            return Usage::Normal;
        }

        if estimate_ms > self.threshold_ms {
            let since = *self.overusing_since.get_or_insert(arrival);
            self.overuse_count += 1;

            let sustained = arrival.duration_since(since) >= self.overuse_time_threshold;
            if sustained && self.overuse_count > 1 && estimate_ms >= self.prev_estimate {
                return Usage::Over;
            }

            // Not sustained yet, keep the previous verdict but never report
            // overuse prematurely.
            if self.usage == Usage::Over {
                return Usage::Over;
            }
            return Usage::Normal;
        }

        self.overusing_since = None;
        self.overuse_count = 0;

        if estimate_ms < -self.threshold_ms {
            Usage::Under
        } else {
            Usage::Normal
        }
    }

    fn adapt_threshold(&mut self, arrival: Instant, estimate_ms: f64) {
        let Some(last) = self.last_update else {
            self.last_update = Some(arrival);
            return;
        };

        if estimate_ms.abs() > self.threshold_ms + MAX_ADAPT_OFFSET_MS {
            // A spike far above the threshold, leave the threshold alone.
            self.last_update = Some(arrival);
            return;
        }

        let k = if estimate_ms.abs() > self.threshold_ms {
            self.k_up
        } else {
            self.k_down
        };

        let dt_ms = (arrival.saturating_duration_since(last).as_millis() as f64)
            .min(MAX_ADAPT_TIME_DELTA_MS);
        self.threshold_ms += k * (estimate_ms.abs() - self.threshold_ms) * dt_ms;
        self.threshold_ms = self.threshold_ms.clamp(self.bounds_ms.0, self.bounds_ms.1);
        self.last_update = Some(arrival);

        trace!("Adaptive threshold now {:.3}ms", self.threshold_ms);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn detector() -> OveruseDetector {
        OveruseDetector::new(&Config::default())
    }

    #[test]
    fn normal_until_enough_samples() {
        let now = Instant::now();
        let mut od = detector();

        assert_eq!(od.update(now, 100.0, 1), Usage::Normal);
    }

    #[test]
    fn sustained_positive_estimate_is_overuse() {
        let now = Instant::now();
        let mut od = detector();

        // Above the initial 12.5 ms threshold, but not sustained yet.
        assert_eq!(od.update(now, 20.0, 2), Usage::Normal);
        // 5 ms later, still under the 10 ms sustain requirement.
        assert_eq!(od.update(now + Duration::from_millis(5), 21.0, 3), Usage::Normal);
        // 12 ms after the first over-threshold sample: overuse.
        assert_eq!(od.update(now + Duration::from_millis(12), 22.0, 4), Usage::Over);
    }

    #[test]
    fn decreasing_estimate_is_not_overuse() {
        let now = Instant::now();
        let mut od = detector();

        assert_eq!(od.update(now, 30.0, 2), Usage::Normal);
        // Sustained, but falling: the queue is draining.
        assert_eq!(
            od.update(now + Duration::from_millis(15), 20.0, 3),
            Usage::Normal
        );
    }

    #[test]
    fn negative_estimate_is_underuse() {
        let now = Instant::now();
        let mut od = detector();

        assert_eq!(od.update(now, -20.0, 2), Usage::Under);
    }

    #[test]
    fn threshold_drifts_towards_estimate() {
        let now = Instant::now();
        let mut od = detector();

        let initial = od.threshold_ms();

        // Repeated samples just above the threshold pull it up (k_up).
        let mut t = now;
        for _ in 0..50 {
            let th = od.threshold_ms();
            t += Duration::from_millis(20);
            od.update(t, th + 5.0, 10);
        }
        assert!(od.threshold_ms() > initial);

        // Quiet samples let it drift back down slowly (k_down).
        let peak = od.threshold_ms();
        for _ in 0..50 {
            t += Duration::from_millis(20);
            od.update(t, 0.0, 100);
        }
        assert!(od.threshold_ms() < peak);
    }

    #[test]
    fn threshold_stays_within_bounds() {
        let now = Instant::now();
        let mut od = detector();

        let mut t = now;
        // Hammer it downwards.
        for _ in 0..10_000 {
            t += Duration::from_millis(100);
            od.update(t, 0.0, 100);
        }
        assert!(od.threshold_ms() >= 6.0);
    }
}
