use std::fmt;
use std::time::{Duration, Instant};

use super::macros::log_rate_control_state;
use super::overuse::Usage;
use crate::units::Bitrate;
use crate::util::MovingAverage;
use crate::Config;

/// Multiplicative increase per second in the absence of congestion.
const MULTIPLICATIVE_INCREASE_PER_SECOND: f64 = 1.08;
/// Floor for a single increase step (bps).
const MIN_INCREASE_BPS: f64 = 1_000.0;
/// Assumed response granularity added to the RTT when sizing additive
/// increases.
const DEFAULT_BACKOFF_TIME: Duration = Duration::from_millis(100);
/// RTT assumed before any measurement exists.
const DEFAULT_RTT: Duration = Duration::from_millis(200);
/// The estimate may not exceed this multiple of the proven link capacity.
const LINK_CAPACITY_HEADROOM: f64 = 2.5;
/// Smoothing for the link capacity average.
const LINK_CAPACITY_SMOOTHING: f64 = 0.05;
/// Near convergence when the acked bitrate is within this band around the
/// rate we last decreased from.
const NEAR_CONVERGENCE_BAND: (f64, f64) = (0.85, 1.15);
/// Nominal video frame rate used to size the expected packet.
const NOMINAL_FPS: f64 = 30.0;
/// Nominal MTU-sized packet in bits.
const NOMINAL_PACKET_BITS: f64 = 1_200.0 * 8.0;

/// AIMD rate controller of the delay branch.
///
/// Grows multiplicatively while far from the proven capacity, additively
/// close to it, and backs off to a fraction of the delivered rate on
/// overuse.
pub(crate) struct RateControl {
    state: State,
    estimated: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    beta: f64,

    /// The acked bitrate observed when we last decreased.
    last_decrease: Option<Bitrate>,
    /// EWMA of the acked bitrate, a conservative link capacity proxy.
    link_capacity: MovingAverage,
    last_update: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl RateControl {
    pub fn new(config: &Config) -> Self {
        RateControl {
            state: State::Increase,
            estimated: config.initial_bitrate,
            min_bitrate: config.min_bitrate,
            max_bitrate: config.max_bitrate,
            beta: config.beta,
            last_decrease: None,
            link_capacity: MovingAverage::new(LINK_CAPACITY_SMOOTHING),
            last_update: None,
            last_rtt: None,
        }
    }

    /// Run one controller tick with the current usage verdict.
    pub fn update(
        &mut self,
        now: Instant,
        usage: Usage,
        acked_bitrate: Option<Bitrate>,
        rtt: Option<Duration>,
    ) -> Bitrate {
        if let Some(rtt) = rtt {
            self.last_rtt = Some(rtt);
        }
        if let Some(acked) = acked_bitrate {
            self.link_capacity.update(acked.as_f64());
        }

        let next = self.state.transition(usage);
        if next != self.state {
            debug!("Rate control state {} -> {}", self.state, next);
            log_rate_control_state!(next as i8);
            self.state = next;
        }

        match self.state {
            State::Increase => self.increase(now, acked_bitrate),
            State::Decrease => self.decrease(now, acked_bitrate),
            State::Hold => {}
        }

        self.estimated
    }

    pub fn estimated_bitrate(&self) -> Bitrate {
        self.estimated
    }

    fn increase(&mut self, now: Instant, acked_bitrate: Option<Bitrate>) {
        let last_update = self.last_update.unwrap_or(now);
        let since_last = now.saturating_duration_since(last_update);

        let near_convergence = self.is_near_convergence(acked_bitrate);

        let new_estimate = if near_convergence {
            // Additive: roughly one expected packet per response time.
            let response_time =
                self.last_rtt.unwrap_or(DEFAULT_RTT) + DEFAULT_BACKOFF_TIME;
            let alpha =
                0.5 * (since_last.as_secs_f64() / response_time.as_secs_f64()).min(1.0);

            self.estimated.as_f64() + (alpha * self.expected_packet_size_bits()).max(MIN_INCREASE_BPS)
        } else {
            // Multiplicative, scaled by how long since the last update.
            let eta = MULTIPLICATIVE_INCREASE_PER_SECOND.powf(since_last.as_secs_f64().min(1.0));
            let increase = ((eta - 1.0) * self.estimated.as_f64()).max(MIN_INCREASE_BPS);

            self.estimated.as_f64() + increase
        };

        // Never run far ahead of what the path has proven to carry.
        let capped = match self.link_capacity.get() {
            Some(capacity) => new_estimate.min(capacity * LINK_CAPACITY_HEADROOM),
            None => new_estimate,
        };

        self.set_estimate(capped.into(), now);
    }

    fn decrease(&mut self, now: Instant, acked_bitrate: Option<Bitrate>) {
        if !self.time_to_reduce_further(now, acked_bitrate) {
            return;
        }

        let mut new_estimate = match acked_bitrate {
            Some(acked) => {
                self.last_decrease = Some(acked);
                acked * self.beta
            }
            // Nothing delivered that we know of, back off the estimate
            // itself.
            None => self.estimated * self.beta,
        };

        if new_estimate > self.estimated {
            // Never increase on overuse.
            new_estimate = self.estimated;
        }

        self.set_estimate(new_estimate, now);
    }

    /// Rate reductions are spaced at least one RTT apart (clamped to
    /// 10-200 ms), unless throughput collapsed below half the estimate.
    fn time_to_reduce_further(&self, now: Instant, acked_bitrate: Option<Bitrate>) -> bool {
        let Some(last_update) = self.last_update else {
            return true;
        };

        let interval = self
            .last_rtt
            .unwrap_or(DEFAULT_BACKOFF_TIME)
            .clamp(Duration::from_millis(10), Duration::from_millis(200));

        if now.saturating_duration_since(last_update) >= interval {
            return true;
        }

        acked_bitrate
            .map(|acked| acked.as_f64() < self.estimated.as_f64() * 0.5)
            .unwrap_or(false)
    }

    fn is_near_convergence(&self, acked_bitrate: Option<Bitrate>) -> bool {
        let (Some(last_decrease), Some(acked)) = (self.last_decrease, acked_bitrate) else {
            return false;
        };

        let low = last_decrease.as_f64() * NEAR_CONVERGENCE_BAND.0;
        let high = last_decrease.as_f64() * NEAR_CONVERGENCE_BAND.1;

        (low..=high).contains(&acked.as_f64())
    }

    fn expected_packet_size_bits(&self) -> f64 {
        let bits_per_frame = self.estimated.as_f64() / NOMINAL_FPS;
        let packets_per_frame = (bits_per_frame / NOMINAL_PACKET_BITS).ceil().max(1.0);

        bits_per_frame / packets_per_frame
    }

    fn set_estimate(&mut self, bitrate: Bitrate, now: Instant) {
        self.estimated = bitrate.clamp(self.min_bitrate, self.max_bitrate);
        self.last_update = Some(now);
    }
}

/// Rate controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Increase = 1,
    Hold = 0,
    Decrease = -1,
}

impl State {
    /// The transition table. Total over `(State, Usage)`.
    pub fn transition(self, usage: Usage) -> State {
        match (self, usage) {
            (_, Usage::Over) => State::Decrease,
            (_, Usage::Under) => State::Hold,
            (State::Hold | State::Increase, Usage::Normal) => State::Increase,
            (State::Decrease, Usage::Normal) => State::Hold,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Increase => write!(f, "increase"),
            State::Hold => write!(f, "hold"),
            State::Decrease => write!(f, "decrease"),
        }
    }
}
