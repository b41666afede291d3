use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::units::{Bitrate, DataSize};

/// Window used until the first estimate exists.
const INITIAL_WINDOW: Duration = Duration::from_millis(500);
/// Window for subsequent estimates.
const WINDOW: Duration = Duration::from_millis(150);

/// Estimates the delivered (acknowledged) bitrate over a sliding window of
/// remote receive times.
///
/// This is the `ack_rate` input to the AIMD controller: on overuse the rate
/// backs off relative to what the path actually delivered, not relative to
/// what we tried to send.
#[derive(Debug)]
pub(crate) struct AckedBitrateEstimator {
    samples: VecDeque<(Instant, DataSize)>,
    estimate: Option<Bitrate>,
}

impl AckedBitrateEstimator {
    pub fn new() -> Self {
        AckedBitrateEstimator {
            samples: VecDeque::new(),
            estimate: None,
        }
    }

    /// Record one acked packet by its remote receive time.
    ///
    /// Receive times must be fed in non-decreasing order; stragglers are
    /// ignored.
    pub fn update(&mut self, receive_time: Instant, size: DataSize) {
        if let Some((newest, _)) = self.samples.back() {
            if receive_time < *newest {
                return;
            }
        }

        self.samples.push_back((receive_time, size));

        let window = if self.estimate.is_none() {
            INITIAL_WINDOW
        } else {
            WINDOW
        };

        while let Some((oldest, _)) = self.samples.front() {
            if receive_time.duration_since(*oldest) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let Some((oldest, _)) = self.samples.front() else {
            return;
        };
        let span = receive_time.duration_since(*oldest);
        if span < window.mul_f64(0.5) {
            // Not enough coverage yet for a meaningful rate.
            return;
        }

        let sum: DataSize = self.samples.iter().map(|(_, s)| *s).sum();
        self.estimate = Some(sum / span);
    }

    pub fn estimate(&self) -> Option<Bitrate> {
        self.estimate
    }
}
