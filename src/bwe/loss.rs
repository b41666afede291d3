use super::macros::{log_loss, log_loss_bitrate_estimate};
use crate::feedback::Acknowledgment;
use crate::units::Bitrate;
use crate::Config;

/// Loss below this is treated as noise and probed through.
const LOW_LOSS_THRESHOLD: f64 = 0.02;
/// Loss above this backs the estimate off.
const HIGH_LOSS_THRESHOLD: f64 = 0.10;
/// Probe factor applied in the low loss band.
const PROBE_FACTOR: f64 = 1.05;

/// Loss based bandwidth ceiling.
///
/// Works on the acked loss ratio of each feedback batch: probes upwards
/// while loss is negligible, holds in the moderate band, and backs off
/// proportionally to the loss when it gets high
/// (`draft-ietf-rmcat-gcc-02` section 6 shape).
#[derive(Debug)]
pub(crate) struct LossController {
    estimate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
}

impl LossController {
    pub fn new(config: &Config) -> Self {
        LossController {
            estimate: config.initial_bitrate,
            min_bitrate: config.min_bitrate,
            max_bitrate: config.max_bitrate,
        }
    }

    /// Update from one feedback batch. Acks with `arrival == None` count as
    /// lost.
    pub fn update(&mut self, acks: &[Acknowledgment]) -> Bitrate {
        if acks.is_empty() {
            return self.estimate;
        }

        let lost = acks.iter().filter(|a| a.arrival.is_none()).count();
        let loss = lost as f64 / acks.len() as f64;
        log_loss!(loss);

        let next = if loss <= LOW_LOSS_THRESHOLD {
            self.estimate * PROBE_FACTOR
        } else if loss <= HIGH_LOSS_THRESHOLD {
            self.estimate
        } else {
            self.estimate * (1.0 - 0.5 * loss)
        };

        self.estimate = next.clamp(self.min_bitrate, self.max_bitrate);
        log_loss_bitrate_estimate!(self.estimate.as_f64());

        self.estimate
    }

    pub fn estimate(&self) -> Bitrate {
        self.estimate
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::feedback::Ecn;
    use crate::units::DataSize;

    fn controller(initial: u64) -> LossController {
        let config = Config {
            initial_bitrate: Bitrate::bps(initial),
            min_bitrate: Bitrate::bps(50_000),
            max_bitrate: Bitrate::mbps(50),
            ..Default::default()
        };
        LossController::new(&config)
    }

    fn batch(total: usize, lost: usize) -> Vec<Acknowledgment> {
        let now = Instant::now();
        (0..total)
            .map(|i| Acknowledgment {
                seq: (i as u64).into(),
                size: DataSize::bytes(1_200),
                departure: now,
                arrival: (i >= lost).then_some(now),
                ecn: Ecn::NotEct,
            })
            .collect()
    }

    #[test]
    fn zero_loss_probes_upwards() {
        let mut lc = controller(1_000_000);
        lc.update(&batch(100, 0));
        assert_eq!(lc.estimate().as_u64(), 1_050_000);
    }

    #[test]
    fn moderate_loss_holds() {
        let mut lc = controller(1_000_000);
        lc.update(&batch(100, 5));
        assert_eq!(lc.estimate().as_u64(), 1_000_000);
    }

    #[test]
    fn heavy_loss_backs_off_proportionally() {
        let mut lc = controller(1_000_000);
        // 50% loss: factor 1 - 0.25 = 0.75.
        lc.update(&batch(100, 50));
        assert_eq!(lc.estimate().as_u64(), 750_000);
    }

    #[test]
    fn empty_batches_leave_the_estimate() {
        let mut lc = controller(1_000_000);
        lc.update(&[]);
        assert_eq!(lc.estimate().as_u64(), 1_000_000);
    }

    #[test]
    fn estimate_respects_bounds() {
        let mut lc = controller(60_000);
        for _ in 0..100 {
            lc.update(&batch(10, 9));
        }
        assert_eq!(lc.estimate().as_u64(), 50_000);
    }
}
