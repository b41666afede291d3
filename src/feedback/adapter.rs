use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::rtp::{extend_u16, RtpHeader, SeqNo, Ssrc};
use crate::units::DataSize;
use crate::Error;

use super::ccfb::CcfbReport;
use super::ntp::ntp_short_to_duration;
use super::twcc::Twcc;
use super::Ecn;

/// How long history entries survive beyond the departure of the highest
/// acked packet.
const HISTORY_WINDOW: Duration = Duration::from_millis(500);

/// One sent packet correlated with its feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Extended transport-wide sequence number.
    pub seq: SeqNo,
    /// On-wire RTP size (header + payload).
    pub size: DataSize,
    /// Local send time.
    pub departure: Instant,
    /// Receiver-reported arrival. `None` when the receiver explicitly
    /// reported the packet as not received.
    pub arrival: Option<Instant>,
    /// ECN marking, only populated from RFC 8888 feedback.
    pub ecn: Ecn,
}

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    seq: SeqNo,
    ssrc: Ssrc,
    /// Extended per-SSRC RTP sequence number, for RFC 8888 correlation.
    rtp_seq: u64,
    size: DataSize,
    departure: Instant,
}

/// Correlates outgoing RTP packets with incoming transport feedback.
///
/// The adapter is the sole owner and mutator of the packet history. Both
/// feedback flavors produce the same [`Acknowledgment`] stream, ordered by
/// sequence number.
#[derive(Debug)]
pub struct FeedbackAdapter {
    /// Send history in transport-wide sequence order.
    history: VecDeque<SentPacket>,
    /// Per-SSRC send order, mapping extended RTP seq to transport-wide seq.
    ssrc_index: HashMap<Ssrc, VecDeque<(u64, SeqNo)>>,
    /// Last extended RTP seq per SSRC, for unwrapping.
    rtp_seq_state: HashMap<Ssrc, u64>,
    /// Highest extended transport-wide seq registered via `on_sent`.
    last_registered: Option<u64>,
    /// Highest extended transport-wide seq acked so far.
    highest_acked: Option<SeqNo>,
    /// Local anchor for TWCC reference times. Set at the first report.
    twcc_time_zero: Option<Instant>,
    /// Local anchor for CCFB report timestamps: (local time, ntp short
    /// duration) at the first report.
    ccfb_anchor: Option<(Instant, Duration)>,
}

impl FeedbackAdapter {
    pub fn new() -> Self {
        FeedbackAdapter {
            history: VecDeque::new(),
            ssrc_index: HashMap::new(),
            rtp_seq_state: HashMap::new(),
            last_registered: None,
            highest_acked: None,
            twcc_time_zero: None,
            ccfb_anchor: None,
        }
    }

    /// Record an outgoing packet.
    ///
    /// The header must carry the transport-wide sequence extension. The
    /// recorded size is the on-wire RTP size, header included.
    pub fn on_sent(
        &mut self,
        now: Instant,
        header: &RtpHeader,
        payload_len: usize,
    ) -> Result<(), Error> {
        let Some(wire_seq) = header.ext_vals.transport_cc else {
            return Err(Error::MissingTwccExtension);
        };

        let seq = extend_u16(self.last_registered, wire_seq);
        self.last_registered = Some(seq);

        let rtp_seq = extend_u16(
            self.rtp_seq_state.get(&header.ssrc).copied(),
            header.sequence_number,
        );
        self.rtp_seq_state.insert(header.ssrc, rtp_seq);

        let size = DataSize::from(header.marshal_size() + payload_len);

        let packet = SentPacket {
            seq: seq.into(),
            ssrc: header.ssrc,
            rtp_seq,
            size,
            departure: now,
        };

        // Senders race for sequence numbers, so a packet can be registered
        // slightly out of order. Keep the history sorted.
        match self.history.back() {
            Some(last) if last.seq >= packet.seq => {
                if let Err(idx) = self.history.binary_search_by_key(&packet.seq, |p| p.seq) {
                    self.history.insert(idx, packet);
                }
            }
            _ => self.history.push_back(packet),
        }

        let index = self.ssrc_index.entry(header.ssrc).or_default();
        match index.back() {
            Some((last_rtp, _)) if *last_rtp >= rtp_seq => {
                if let Err(idx) = index.binary_search_by_key(&rtp_seq, |(s, _)| *s) {
                    index.insert(idx, (rtp_seq, seq.into()));
                }
            }
            _ => index.push_back((rtp_seq, seq.into())),
        }

        Ok(())
    }

    /// Apply a TWCC report, emitting acknowledgments for the packets still
    /// in history. Unknown sequences (already evicted) are dropped.
    pub fn on_transport_cc_feedback(
        &mut self,
        twcc: &Twcc,
        now: Instant,
    ) -> Result<Vec<Acknowledgment>, Error> {
        let time_zero = *self.twcc_time_zero.get_or_insert(now);

        let mut acks = Vec::with_capacity(twcc.status_count as usize);
        for (seq, arrival) in twcc.iter(time_zero, self.last_registered) {
            let Some(sent) = self.lookup(seq) else {
                continue;
            };

            acks.push(Acknowledgment {
                seq,
                size: sent.size,
                departure: sent.departure,
                arrival,
                ecn: Ecn::NotEct,
            });
        }

        self.finish_report(&mut acks);
        Ok(acks)
    }

    /// Apply an RFC 8888 report, emitting acknowledgments analogous to
    /// [`FeedbackAdapter::on_transport_cc_feedback`].
    pub fn on_ccfb_feedback(
        &mut self,
        report: &CcfbReport,
        now: Instant,
    ) -> Result<Vec<Acknowledgment>, Error> {
        let rts = ntp_short_to_duration(report.report_timestamp);
        let (anchor_local, anchor_rts) = *self.ccfb_anchor.get_or_insert((now, rts));

        // Report timestamp mapped into the local clock.
        let report_time = if rts >= anchor_rts {
            anchor_local + (rts - anchor_rts)
        } else {
            // Reordered report from before the anchor.
            anchor_local
                .checked_sub(anchor_rts - rts)
                .unwrap_or(anchor_local)
        };

        let mut acks = Vec::new();
        for block in &report.blocks {
            let Some(last_rtp_seq) = self.rtp_seq_state.get(&block.ssrc).copied() else {
                // SSRC we never sent on.
                continue;
            };
            let base = extend_u16(Some(last_rtp_seq), block.begin_seq);

            for (i, metric) in block.metrics.iter().enumerate() {
                let rtp_seq = base + i as u64;
                let Some(sent) = self.lookup_by_rtp_seq(block.ssrc, rtp_seq) else {
                    continue;
                };

                let arrival = metric
                    .arrival_offset
                    .filter(|_| metric.received)
                    .and_then(|ato| report_time.checked_sub(ato));

                acks.push(Acknowledgment {
                    seq: sent.seq,
                    size: sent.size,
                    departure: sent.departure,
                    arrival,
                    ecn: metric.ecn,
                });
            }
        }

        self.finish_report(&mut acks);
        Ok(acks)
    }

    /// Number of packets currently tracked.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn lookup(&self, seq: SeqNo) -> Option<SentPacket> {
        let idx = self.history.binary_search_by_key(&seq, |p| p.seq).ok()?;
        Some(self.history[idx])
    }

    fn lookup_by_rtp_seq(&self, ssrc: Ssrc, rtp_seq: u64) -> Option<SentPacket> {
        let index = self.ssrc_index.get(&ssrc)?;
        let idx = index.binary_search_by_key(&rtp_seq, |(s, _)| *s).ok()?;
        let (_, seq) = index[idx];
        self.lookup(seq)
    }

    fn finish_report(&mut self, acks: &mut Vec<Acknowledgment>) {
        acks.sort_by_key(|a| a.seq);

        if let Some(last) = acks.last() {
            self.highest_acked = self.highest_acked.max(Some(last.seq));
        }
        self.evict();
    }

    /// Drop history entries older than the feedback window, relative to the
    /// departure time of the highest acked packet.
    fn evict(&mut self) {
        let Some(highest) = self.highest_acked else {
            return;
        };
        let Some(anchor) = self.lookup(highest).map(|p| p.departure) else {
            return;
        };

        while let Some(front) = self.history.front() {
            if front.seq < highest && front.departure + HISTORY_WINDOW < anchor {
                let evicted = self.history.pop_front().expect("front just observed");
                if let Some(index) = self.ssrc_index.get_mut(&evicted.ssrc) {
                    while index.front().map(|(_, s)| *s <= evicted.seq).unwrap_or(false) {
                        index.pop_front();
                    }
                }
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::twcc::TwccBuilder;
    use super::super::{PacketMetric, SsrcBlock};
    use super::*;
    use crate::feedback::ntp::duration_to_ntp_short;
    use crate::rtp::ExtensionValues;

    fn header(ssrc: u32, rtp_seq: u16, twcc_seq: u16) -> RtpHeader {
        RtpHeader {
            ssrc: ssrc.into(),
            sequence_number: rtp_seq,
            ext_vals: ExtensionValues {
                transport_cc: Some(twcc_seq),
            },
            ..Default::default()
        }
    }

    #[test]
    fn on_sent_requires_twcc_extension() {
        let mut adapter = FeedbackAdapter::new();
        let mut h = header(1, 0, 0);
        h.ext_vals.transport_cc = None;

        assert!(matches!(
            adapter.on_sent(Instant::now(), &h, 1200),
            Err(Error::MissingTwccExtension)
        ));
    }

    #[test]
    fn twcc_feedback_produces_ordered_acks() {
        let now = Instant::now();
        let mut adapter = FeedbackAdapter::new();

        for i in 0..4_u16 {
            adapter
                .on_sent(now + Duration::from_millis(i as u64 * 10), &header(1, i, i), 1188)
                .unwrap();
        }

        let mut builder = TwccBuilder::new(now);
        builder.record(0, Some(now + Duration::from_millis(30)));
        builder.record(1, Some(now + Duration::from_millis(40)));
        builder.record(2, None);
        builder.record(3, Some(now + Duration::from_millis(60)));
        let twcc = builder.build().unwrap();

        let acks = adapter
            .on_transport_cc_feedback(&twcc, now + Duration::from_millis(70))
            .unwrap();

        assert_eq!(acks.len(), 4);
        assert!(acks.windows(2).all(|w| w[0].seq < w[1].seq));
        // On-wire size includes the 20 byte header (12 + twcc extension).
        assert_eq!(acks[0].size, DataSize::bytes(1208));
        assert!(acks[2].arrival.is_none(), "lost packet acked with no arrival");
        assert!(acks[3].arrival.is_some());
    }

    #[test]
    fn unknown_seqs_are_dropped() {
        let now = Instant::now();
        let mut adapter = FeedbackAdapter::new();

        adapter.on_sent(now, &header(1, 0, 0), 1000).unwrap();

        let mut builder = TwccBuilder::new(now);
        builder.record(0, Some(now + Duration::from_millis(5)));
        // Sequences 1 and 2 were never registered.
        builder.record(1, Some(now + Duration::from_millis(6)));
        builder.record(2, Some(now + Duration::from_millis(7)));
        let twcc = builder.build().unwrap();

        let acks = adapter.on_transport_cc_feedback(&twcc, now).unwrap();
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn history_is_bounded_by_age() {
        let now = Instant::now();
        let mut adapter = FeedbackAdapter::new();

        // Two seconds of packets at 10 ms spacing.
        for i in 0..200_u64 {
            adapter
                .on_sent(
                    now + Duration::from_millis(i * 10),
                    &header(1, i as u16, i as u16),
                    1000,
                )
                .unwrap();
        }
        assert_eq!(adapter.history_len(), 200);

        // Ack the last packet; everything sent more than 500 ms before it
        // goes away.
        let mut builder = TwccBuilder::new(now);
        builder.record(199, Some(now + Duration::from_millis(2015)));
        let twcc = builder.build().unwrap();
        adapter
            .on_transport_cc_feedback(&twcc, now + Duration::from_millis(2020))
            .unwrap();

        // Departure of seq 199 is t=1990ms; the window keeps departures from
        // t=1490ms, i.e. seqs 149..=199.
        assert_eq!(adapter.history_len(), 51);
    }

    #[test]
    fn ccfb_feedback_correlates_by_ssrc_and_seq() {
        let now = Instant::now();
        let mut adapter = FeedbackAdapter::new();

        adapter.on_sent(now, &header(10, 100, 0), 500).unwrap();
        adapter
            .on_sent(now + Duration::from_millis(5), &header(20, 700, 1), 600)
            .unwrap();
        adapter
            .on_sent(now + Duration::from_millis(10), &header(10, 101, 2), 500)
            .unwrap();

        let report_rts = Duration::from_secs(1000);
        let report = CcfbReport {
            sender_ssrc: 1.into(),
            blocks: vec![
                SsrcBlock {
                    ssrc: 10.into(),
                    begin_seq: 100,
                    metrics: vec![
                        PacketMetric::received(Ecn::Ect0, Duration::from_millis(40)),
                        PacketMetric::lost(),
                    ],
                },
                SsrcBlock {
                    ssrc: 20.into(),
                    begin_seq: 700,
                    metrics: vec![PacketMetric::received(Ecn::NotEct, Duration::from_millis(30))],
                },
            ],
            report_timestamp: duration_to_ntp_short(report_rts),
        };

        let acks = adapter
            .on_ccfb_feedback(&report, now + Duration::from_millis(60))
            .unwrap();

        assert_eq!(acks.len(), 3);
        // Sorted by transport-wide seq: ssrc 10/seq 100, ssrc 20/seq 700,
        // ssrc 10/seq 101.
        assert_eq!(acks[0].seq, 0.into());
        assert_eq!(acks[0].ecn, Ecn::Ect0);
        assert!(acks[0].arrival.is_some());
        assert_eq!(acks[1].seq, 1.into());
        assert!(acks[2].arrival.is_none());

        // Arrival offsets count back from the report timestamp: the ssrc 20
        // packet arrived 10 ms after the ssrc 10 packet.
        let d = acks[1].arrival.unwrap() - acks[0].arrival.unwrap();
        assert!(d >= Duration::from_millis(9) && d <= Duration::from_millis(11));
    }

    #[test]
    fn twcc_seq_unwraps_across_wrap_around() {
        let now = Instant::now();
        let mut adapter = FeedbackAdapter::new();

        adapter.on_sent(now, &header(1, 0, 65_534), 100).unwrap();
        adapter
            .on_sent(now + Duration::from_millis(1), &header(1, 1, 65_535), 100)
            .unwrap();
        adapter
            .on_sent(now + Duration::from_millis(2), &header(1, 2, 0), 100)
            .unwrap();

        let mut builder = TwccBuilder::new(now);
        builder.record(65_534, Some(now + Duration::from_millis(10)));
        builder.record(65_535, Some(now + Duration::from_millis(11)));
        builder.record(0, Some(now + Duration::from_millis(12)));
        let twcc = builder.build().unwrap();

        let acks = adapter
            .on_transport_cc_feedback(&twcc, now + Duration::from_millis(20))
            .unwrap();

        assert_eq!(acks.len(), 3);
        assert_eq!(acks[2].seq, 65_536.into());
    }
}
