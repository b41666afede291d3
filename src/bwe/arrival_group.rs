use std::time::Instant;

use crate::feedback::Acknowledgment;
use crate::time::TimeDelta;
use crate::units::DataSize;
use crate::Config;

/// A burst of packets considered to have been sent (and received) together.
///
/// Groups are compared pairwise to measure how the one-way delay evolves
/// between bursts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArrivalGroup {
    pub first_departure: Instant,
    pub first_arrival: Instant,
    pub last_departure: Instant,
    pub last_arrival: Instant,
    pub size: DataSize,
    pub packets: usize,
}

impl ArrivalGroup {
    fn new(departure: Instant, arrival: Instant, size: DataSize) -> Self {
        ArrivalGroup {
            first_departure: departure,
            first_arrival: arrival,
            last_departure: departure,
            last_arrival: arrival,
            size,
            packets: 1,
        }
    }

    fn add(&mut self, departure: Instant, arrival: Instant, size: DataSize) {
        self.last_departure = self.last_departure.max(departure);
        self.last_arrival = self.last_arrival.max(arrival);
        self.size += size;
        self.packets += 1;
    }
}

/// Absorbs acknowledgments into the current arrival group and flushes the
/// group when a new ack no longer belongs to it.
#[derive(Debug)]
pub(crate) struct ArrivalGroupAccumulator {
    current: Option<ArrivalGroup>,
    burst_interval: TimeDelta,
    max_burst_duration: TimeDelta,
}

impl ArrivalGroupAccumulator {
    pub fn new(config: &Config) -> Self {
        ArrivalGroupAccumulator {
            current: None,
            burst_interval: config.burst_interval.into(),
            max_burst_duration: config.max_burst_duration.into(),
        }
    }

    /// Absorb one acknowledged packet. Returns the finished group when the
    /// packet starts a new one.
    ///
    /// Only call with acks that have an arrival time.
    pub fn on_ack(&mut self, ack: &Acknowledgment) -> Option<ArrivalGroup> {
        let arrival = ack.arrival?;

        let Some(group) = &mut self.current else {
            self.current = Some(ArrivalGroup::new(ack.departure, arrival, ack.size));
            return None;
        };

        let first_send_delta = TimeDelta::between(ack.departure, group.first_departure);
        if first_send_delta.is_negative() {
            // Out of order send time, not usable for grouping.
            trace!("Skipping out of order ack {:?}", ack.seq);
            return None;
        }

        if first_send_delta < self.burst_interval {
            group.add(ack.departure, arrival, ack.size);
            return None;
        }

        // Packets sent farther apart can still form one burst when they
        // queue behind each other: the arrival spread is then smaller than
        // the send spread.
        let arrival_delta_first = TimeDelta::between(arrival, group.first_arrival);
        let arrival_delta_last = TimeDelta::between(arrival, group.last_arrival);
        let propagation_delta = arrival_delta_first - first_send_delta;

        if propagation_delta.is_negative()
            && arrival_delta_last <= self.burst_interval
            && arrival_delta_first < self.max_burst_duration
        {
            group.add(ack.departure, arrival, ack.size);
            return None;
        }

        let finished = self
            .current
            .replace(ArrivalGroup::new(ack.departure, arrival, ack.size));

        finished
    }
}
