#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use paceline::bwe::SendSideEstimator;
use paceline::feedback::{feedback_rtt, FeedbackAdapter, Twcc, TwccBuilder};
use paceline::rtp::{ExtensionValues, RtpHeader};
use paceline::{Bitrate, Config};

pub fn init_log() {
    static START: Once = Once::new();

    START.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("paceline=info"));
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    });
}

/// A one-way link with capacity, propagation delay, jitter and loss.
///
/// Queueing is modeled with a single busy cursor: packets serialize one
/// after another at link capacity, and anything that would sit in the queue
/// longer than the drop threshold is tail dropped.
pub struct Link {
    /// Bits per second. `None` is an unconstrained link.
    capacity: Option<f64>,
    base_delay: Duration,
    jitter: Duration,
    /// Bernoulli loss probability.
    loss: f64,
    /// Tail drop when a packet would wait longer than this.
    max_queue: Duration,
    busy_until: Option<Instant>,
    rng: StdRng,
}

impl Link {
    pub fn new(seed: u64) -> Self {
        Link {
            capacity: None,
            base_delay: Duration::from_millis(20),
            jitter: Duration::ZERO,
            loss: 0.0,
            max_queue: Duration::from_millis(300),
            busy_until: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(mut self, bps: u64) -> Self {
        self.capacity = Some(bps as f64);
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }

    pub fn set_capacity(&mut self, bps: u64) {
        self.capacity = Some(bps as f64);
    }

    /// Transmit a packet, returning its arrival time, or `None` when it is
    /// lost.
    pub fn transmit(&mut self, departure: Instant, bytes: usize) -> Option<Instant> {
        if self.loss > 0.0 && self.rng.gen::<f64>() < self.loss {
            return None;
        }

        let serialization = match self.capacity {
            Some(capacity) => Duration::from_secs_f64(bytes as f64 * 8.0 / capacity),
            None => Duration::ZERO,
        };

        let start = match self.busy_until {
            Some(busy) if busy > departure => {
                if busy - departure > self.max_queue {
                    // Queue full.
                    return None;
                }
                busy
            }
            _ => departure,
        };

        let done = start + serialization;
        self.busy_until = Some(done);

        let jitter = self
            .jitter
            .mul_f64(self.rng.gen::<f64>())
            .min(self.jitter);

        Some(done + self.base_delay + jitter)
    }
}

/// Closed loop simulation: a sender paced by its own estimate, a link, and
/// a TWCC receiver reporting every 50 ms.
pub struct Simulation {
    pub base: Instant,
    pub link: Link,
    adapter: FeedbackAdapter,
    pub estimator: SendSideEstimator,
    builder: TwccBuilder,
    seq: u16,
    debt_bytes: f64,
    pending_feedback: Vec<(Instant, Twcc)>,
    /// Drop every second feedback report on the way back.
    pub drop_alternate_feedback: bool,
    report_counter: u64,
    sim_ms: u64,
    /// `(sim time, published target)` after every processed report.
    pub trace: Vec<(Duration, Bitrate)>,
}

const PACKET_PAYLOAD: usize = 1_180;
const SEND_TICK_MS: u64 = 10;
const REPORT_INTERVAL_MS: u64 = 50;
const FEEDBACK_DELAY: Duration = Duration::from_millis(20);

impl Simulation {
    pub fn new(config: &Config, link: Link) -> Self {
        let base = Instant::now();
        Simulation {
            base,
            link,
            adapter: FeedbackAdapter::new(),
            estimator: SendSideEstimator::new(config),
            builder: TwccBuilder::new(base),
            seq: 0,
            debt_bytes: 0.0,
            pending_feedback: Vec::new(),
            drop_alternate_feedback: false,
            report_counter: 0,
            sim_ms: 0,
            trace: Vec::new(),
        }
    }

    pub fn target(&self) -> Bitrate {
        self.estimator.target()
    }

    /// Advance the simulation by `seconds` of virtual time.
    pub fn run(&mut self, seconds: u64) {
        let end = self.sim_ms + seconds * 1_000;

        while self.sim_ms < end {
            let now = self.base + Duration::from_millis(self.sim_ms);

            if self.sim_ms % SEND_TICK_MS == 0 {
                self.send_tick(now);
            }

            if self.sim_ms % REPORT_INTERVAL_MS == 0 && self.sim_ms > 0 {
                self.build_report(now);
            }

            self.deliver_feedback(now);

            self.sim_ms += 1;
        }
    }

    /// Targets sampled at or after `since` into the run.
    pub fn targets_since(&self, since: Duration) -> Vec<Bitrate> {
        self.trace
            .iter()
            .filter(|(t, _)| *t >= since)
            .map(|(_, b)| *b)
            .collect()
    }

    fn send_tick(&mut self, now: Instant) {
        let rate = self.estimator.target().as_f64();
        self.debt_bytes += rate / 8.0 * (SEND_TICK_MS as f64 / 1_000.0);

        // The synthetic codec emits full packets whenever it has the bytes
        // for them.
        let mut header = RtpHeader {
            ssrc: 1.into(),
            payload_type: 96.into(),
            ..Default::default()
        };
        let wire_size = header.marshal_size() + 8 + PACKET_PAYLOAD;

        while self.debt_bytes >= wire_size as f64 {
            self.debt_bytes -= wire_size as f64;

            header.sequence_number = self.seq;
            header.ext_vals = ExtensionValues {
                transport_cc: Some(self.seq),
            };

            self.adapter
                .on_sent(now, &header, PACKET_PAYLOAD)
                .expect("twcc extension present");

            let size = header.marshal_size() + PACKET_PAYLOAD;
            self.builder.record(self.seq, self.link.transmit(now, size));
            self.seq = self.seq.wrapping_add(1);
        }
    }

    fn build_report(&mut self, now: Instant) {
        let Some(report) = self.builder.build() else {
            return;
        };

        self.report_counter += 1;
        if self.drop_alternate_feedback && self.report_counter % 2 == 0 {
            return;
        }

        self.pending_feedback.push((now + FEEDBACK_DELAY, report));
    }

    fn deliver_feedback(&mut self, now: Instant) {
        while let Some(pos) = self.pending_feedback.iter().position(|(due, _)| *due <= now) {
            let (due, report) = self.pending_feedback.remove(pos);

            let acks = self
                .adapter
                .on_transport_cc_feedback(&report, due)
                .expect("well formed report");
            if acks.is_empty() {
                continue;
            }

            let sent_time = acks.iter().filter_map(|a| a.arrival).max();
            let rtt = sent_time.and_then(|sent| feedback_rtt(due, sent, &acks));

            let target = self.estimator.on_acks(due, rtt, &acks);
            self.trace
                .push((Duration::from_millis(self.sim_ms), target));
        }
    }
}
