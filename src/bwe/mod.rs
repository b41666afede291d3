//! Bandwidth estimation from transport feedback.
//!
//! The delay branch groups packet arrivals into bursts, feeds the
//! inter-group delay variation through a Kalman filter and an adaptive
//! threshold overuse detector, and drives an AIMD rate controller
//! (`draft-ietf-rmcat-gcc-02`). The loss branch maintains an independent
//! ceiling from the acked loss ratio. The send-side estimator publishes the
//! minimum of the two.

use std::time::{Duration, Instant};

use crate::feedback::Acknowledgment;
use crate::time::TimeDelta;
use crate::units::Bitrate;
use crate::Config;

mod ack_rate;
mod arrival_group;
mod kalman;
mod loss;
pub(crate) mod macros;
mod overuse;
mod rate_control;

use ack_rate::AckedBitrateEstimator;
use arrival_group::{ArrivalGroup, ArrivalGroupAccumulator};
use kalman::KalmanFilter;
use loss::LossController;
use macros::{log_bitrate_estimate, log_delay_estimate, log_delay_variation, log_target_bitrate};
use rate_control::RateControl;

pub use overuse::Usage;

/// A bandwidth estimator variant.
///
/// The estimators share one capability surface: feed acknowledgment batches
/// in, read a target bitrate out.
pub enum BandwidthEstimator {
    /// Delay and loss based estimation combined (the default).
    SendSide(SendSideEstimator),
    /// Only the delay branch, no loss ceiling.
    DelayOnly(DelayRateController),
    /// A fixed rate, for experiments that bypass estimation.
    Null(Bitrate),
}

impl BandwidthEstimator {
    /// Process one feedback batch and return the updated target.
    pub fn on_acks(
        &mut self,
        now: Instant,
        feedback_rtt: Option<Duration>,
        acks: &[Acknowledgment],
    ) -> Bitrate {
        match self {
            BandwidthEstimator::SendSide(est) => est.on_acks(now, feedback_rtt, acks),
            BandwidthEstimator::DelayOnly(ctrl) => ctrl.on_acks(now, feedback_rtt, acks),
            BandwidthEstimator::Null(rate) => *rate,
        }
    }

    /// The current target without feeding new input.
    pub fn target(&self) -> Bitrate {
        match self {
            BandwidthEstimator::SendSide(est) => est.target(),
            BandwidthEstimator::DelayOnly(ctrl) => ctrl.target(),
            BandwidthEstimator::Null(rate) => *rate,
        }
    }
}

/// The full send-side controller: delay branch and loss branch combined.
pub struct SendSideEstimator {
    delay: DelayRateController,
    loss: LossController,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    target: Bitrate,
}

impl SendSideEstimator {
    pub fn new(config: &Config) -> Self {
        SendSideEstimator {
            delay: DelayRateController::new(config),
            loss: LossController::new(config),
            min_bitrate: config.min_bitrate,
            max_bitrate: config.max_bitrate,
            target: config.initial_bitrate,
        }
    }

    /// Combine both branches over one feedback batch:
    /// `target = clamp(min(r_delay, r_loss), min, max)`.
    pub fn on_acks(
        &mut self,
        now: Instant,
        feedback_rtt: Option<Duration>,
        acks: &[Acknowledgment],
    ) -> Bitrate {
        let delay_rate = self.delay.on_acks(now, feedback_rtt, acks);
        let loss_rate = self.loss.update(acks);

        self.target = delay_rate
            .min(loss_rate)
            .clamp(self.min_bitrate, self.max_bitrate);
        log_target_bitrate!(self.target.as_f64());

        self.target
    }

    pub fn target(&self) -> Bitrate {
        self.target
    }

    /// Current delay branch rate.
    pub fn delay_estimate(&self) -> Bitrate {
        self.delay.target()
    }

    /// Current loss branch ceiling.
    pub fn loss_estimate(&self) -> Bitrate {
        self.loss.estimate()
    }
}

/// The delay branch: arrival grouping, Kalman filtering, overuse detection
/// and AIMD rate control.
pub struct DelayRateController {
    grouping: ArrivalGroupAccumulator,
    last_group: Option<ArrivalGroup>,
    filter: KalmanFilter,
    detector: overuse::OveruseDetector,
    control: RateControl,
    acked_bitrate: AckedBitrateEstimator,
    samples: usize,
}

impl DelayRateController {
    pub fn new(config: &Config) -> Self {
        DelayRateController {
            grouping: ArrivalGroupAccumulator::new(config),
            last_group: None,
            filter: KalmanFilter::new(config),
            detector: overuse::OveruseDetector::new(config),
            control: RateControl::new(config),
            acked_bitrate: AckedBitrateEstimator::new(),
            samples: 0,
        }
    }

    /// Process one feedback batch and run a controller tick.
    pub fn on_acks(
        &mut self,
        now: Instant,
        feedback_rtt: Option<Duration>,
        acks: &[Acknowledgment],
    ) -> Bitrate {
        for ack in acks {
            if let Some(arrival) = ack.arrival {
                self.acked_bitrate.update(arrival, ack.size);
            }
            self.on_ack(ack);
        }

        self.control.update(
            now,
            self.detector.usage(),
            self.acked_bitrate.estimate(),
            feedback_rtt,
        )
    }

    /// Current rate without processing input.
    pub fn target(&self) -> Bitrate {
        self.control.estimated_bitrate()
    }

    /// Whether the detector currently signals overuse.
    pub fn is_overusing(&self) -> bool {
        self.detector.usage() == Usage::Over
    }

    fn on_ack(&mut self, ack: &Acknowledgment) {
        let Some(next) = self.grouping.on_ack(ack) else {
            return;
        };

        let Some(last) = self.last_group.replace(next) else {
            return;
        };

        // Deltas between the last packets of consecutive groups.
        let inter_arrival = TimeDelta::between(next.last_arrival, last.last_arrival);
        let inter_departure = TimeDelta::between(next.last_departure, last.last_departure);
        let delay_variation = inter_arrival - inter_departure;

        if inter_arrival.is_negative() {
            // Groups delivered out of order; one bad sample must not poison
            // the filter.
            warn!("Negative inter-arrival time, skipping group");
            return;
        }

        let size_delta =
            next.size.as_bytes_u64() as f64 - last.size.as_bytes_u64() as f64;

        log_delay_variation!(delay_variation.as_millis_f64());
        let estimate = self.filter.update(delay_variation.as_millis_f64(), size_delta);
        log_delay_estimate!(estimate);

        self.samples += 1;
        let usage = self.detector.update(next.last_arrival, estimate, self.samples);
        trace!(
            "Delay variation {delay_variation}, estimate {estimate:.3}ms, \
             threshold {:.3}ms, usage {usage}",
            self.detector.threshold_ms()
        );
        log_bitrate_estimate!(self.control.estimated_bitrate().as_f64());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feedback::Ecn;
    use crate::units::DataSize;

    fn ack(seq: u64, departure: Instant, arrival: Instant) -> Acknowledgment {
        Acknowledgment {
            seq: seq.into(),
            size: DataSize::bytes(1_200),
            departure,
            arrival: Some(arrival),
            ecn: Ecn::NotEct,
        }
    }

    /// Feed batches of evenly spaced packets, sized to the controller's own
    /// target rate, where the one way delay grows by `ramp_us_per_packet`.
    fn feed(
        ctrl: &mut DelayRateController,
        base: Instant,
        seconds: u64,
        ramp_us_per_packet: u64,
    ) -> Bitrate {
        let mut seq = 0_u64;
        let mut rate = ctrl.target();

        // One batch of 10 packets (10 ms spacing) per 100 ms.
        for batch in 0..seconds * 10 {
            // Sending tracks the current target, as a codec would.
            let packet_bytes = (rate.as_f64() * 0.010 / 8.0).max(100.0) as u64;

            let mut acks = Vec::new();
            for i in 0..10_u64 {
                let departure = base + Duration::from_millis(batch * 100 + i * 10);
                let arrival = departure
                    + Duration::from_millis(20)
                    + Duration::from_micros(seq * ramp_us_per_packet);
                let mut a = ack(seq, departure, arrival);
                a.size = DataSize::bytes(packet_bytes);
                acks.push(a);
                seq += 1;
            }
            let now = base + Duration::from_millis(batch * 100 + 120);
            rate = ctrl.on_acks(now, Some(Duration::from_millis(40)), &acks);
        }

        rate
    }

    #[test]
    fn stable_delay_grows_the_estimate() {
        let base = Instant::now();
        let mut ctrl = DelayRateController::new(&Config::default());

        let initial = ctrl.target();
        let rate = feed(&mut ctrl, base, 10, 0);

        assert!(
            rate.as_f64() > initial.as_f64() * 1.5,
            "constant delay must let the rate grow, got {rate}"
        );
        assert!(!ctrl.is_overusing());
    }

    #[test]
    fn growing_delay_triggers_overuse_and_backoff() {
        let base = Instant::now();
        let mut ctrl = DelayRateController::new(&Config::default());

        // Stable phase.
        let stable = feed(&mut ctrl, base, 5, 0);

        // Strong queue growth: +20 ms of delay per packet, the signature of
        // sending well above capacity.
        let congested_base = base + Duration::from_secs(100);
        let mut congested = DelayRateController::new(&Config::default());
        feed(&mut congested, congested_base, 5, 0);
        let before = congested.target();
        let after = feed(
            &mut congested,
            congested_base + Duration::from_secs(5),
            5,
            20_000,
        );

        assert!(
            after.as_f64() < before.as_f64(),
            "growing delay must reduce the rate ({before} -> {after})"
        );
        // The healthy controller meanwhile kept growing.
        assert!(stable.as_f64() > after.as_f64());
    }

    #[test]
    fn null_estimator_is_fixed() {
        let mut est = BandwidthEstimator::Null(Bitrate::kbps(300));
        let rate = est.on_acks(Instant::now(), None, &[]);
        assert_eq!(rate.as_u64(), 300_000);
        assert_eq!(est.target().as_u64(), 300_000);
    }

    #[test]
    fn send_side_estimator_takes_the_minimum() {
        let base = Instant::now();
        let config = Config::default();
        let mut est = SendSideEstimator::new(&config);

        // A clean batch: both branches move up, target stays clamped
        // between them.
        let acks: Vec<_> = (0..10)
            .map(|i| {
                ack(
                    i,
                    base + Duration::from_millis(i * 10),
                    base + Duration::from_millis(i * 10 + 20),
                )
            })
            .collect();
        let target = est.on_acks(base + Duration::from_millis(120), None, &acks);

        assert_eq!(
            target.as_f64(),
            est.delay_estimate().min(est.loss_estimate()).as_f64()
        );
        assert!(target.as_f64() >= config.min_bitrate.as_f64());
        assert!(target.as_f64() <= config.max_bitrate.as_f64());
    }
}
