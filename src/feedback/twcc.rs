use std::time::{Duration, Instant};

use crate::rtp::{extend_u16, SeqNo, Ssrc};
use crate::time::TimeDelta;
use crate::Error;

/// RTCP payload type for transport layer feedback messages.
pub(crate) const RTPFB: u8 = 205;
/// Feedback message type for transport-wide congestion control.
pub(crate) const FMT_TWCC: u8 = 15;

/// Reference time is in multiples of 64 ms.
const REFERENCE_TIME_UNIT: Duration = Duration::from_millis(64);
/// Receive deltas are in multiples of 250 µs.
const DELTA_UNIT_US: i64 = 250;

/// Transport-wide congestion control feedback
/// (`draft-holmer-rmcat-transport-wide-cc-extensions-01`).
///
/// One report covers a contiguous range of transport-wide sequence numbers,
/// each with a receive status and, for received packets, a delta-encoded
/// arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Twcc {
    /// SSRC of the feedback sender.
    pub sender_ssrc: Ssrc,
    /// SSRC of the media source this feedback is about.
    pub ssrc: Ssrc,
    /// First sequence number covered by this report.
    pub base_seq: u16,
    /// Number of packet statuses in this report.
    pub status_count: u16,
    /// Absolute reference time, 24 bits in 64 ms units.
    pub reference_time: u32,
    /// Report counter for deduplication.
    pub feedback_count: u8,
    /// Packet status chunks.
    pub chunks: Vec<PacketChunk>,
    /// Receive deltas for the received statuses, in chunk order.
    pub deltas: Vec<Delta>,
}

/// Status of a single packet in a TWCC report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    NotReceived = 0b00,
    ReceivedSmallDelta = 0b01,
    ReceivedLargeOrNegativeDelta = 0b10,
    Reserved = 0b11,
}

impl From<u8> for PacketStatus {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0b00 => PacketStatus::NotReceived,
            0b01 => PacketStatus::ReceivedSmallDelta,
            0b10 => PacketStatus::ReceivedLargeOrNegativeDelta,
            _ => PacketStatus::Reserved,
        }
    }
}

/// A packet status chunk: 16 bits covering up to 8191 packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// Run of a single status. 13 bit length.
    Run(PacketStatus, u16),
    /// 14 one-bit symbols, MSB first. 1 = received small delta.
    VectorSingle(u16),
    /// 7 two-bit symbols, MSB first.
    VectorDouble(u16),
}

impl PacketChunk {
    fn len(&self) -> u16 {
        match self {
            PacketChunk::Run(_, n) => *n,
            PacketChunk::VectorSingle(_) => 14,
            PacketChunk::VectorDouble(_) => 7,
        }
    }

    fn symbol(&self, offset: u16) -> PacketStatus {
        match self {
            PacketChunk::Run(status, _) => *status,
            PacketChunk::VectorSingle(bits) => {
                if bits >> (13 - offset) & 1 == 1 {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                }
            }
            PacketChunk::VectorDouble(bits) => {
                PacketStatus::from((bits >> (12 - offset * 2)) as u8)
            }
        }
    }

    fn to_word(self) -> u16 {
        match self {
            PacketChunk::Run(status, n) => {
                debug_assert!(n < 1 << 13);
                (status as u16) << 13 | (n & 0x1fff)
            }
            PacketChunk::VectorSingle(bits) => 1 << 15 | (bits & 0x3fff),
            PacketChunk::VectorDouble(bits) => 1 << 15 | 1 << 14 | (bits & 0x3fff),
        }
    }

    fn from_word(word: u16) -> Self {
        if word & 1 << 15 == 0 {
            let status = PacketStatus::from((word >> 13) as u8);
            PacketChunk::Run(status, word & 0x1fff)
        } else if word & 1 << 14 == 0 {
            PacketChunk::VectorSingle(word & 0x3fff)
        } else {
            PacketChunk::VectorDouble(word & 0x3fff)
        }
    }
}

/// Receive time delta in 250 µs units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// 8 bit unsigned.
    Small(u8),
    /// 16 bit signed.
    Large(i16),
}

impl Delta {
    fn byte_len(&self) -> usize {
        match self {
            Delta::Small(_) => 1,
            Delta::Large(_) => 2,
        }
    }

    fn micros(&self) -> i64 {
        match self {
            Delta::Small(v) => *v as i64 * DELTA_UNIT_US,
            Delta::Large(v) => *v as i64 * DELTA_UNIT_US,
        }
    }
}

impl Twcc {
    /// Parse the feedback payload (after the 4 byte RTCP header).
    pub fn parse(buf: &[u8]) -> Result<Twcc, Error> {
        if buf.len() < 16 {
            return Err(Error::MalformedFeedback("truncated twcc header"));
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]);
        let reference_time = u32::from_be_bytes([0, buf[12], buf[13], buf[14]]);
        let feedback_count = buf[15];

        let mut rest = &buf[16..];

        // Chunks until every status is covered.
        let mut chunks = Vec::new();
        let mut covered = 0_u32;
        while covered < status_count as u32 {
            if rest.len() < 2 {
                return Err(Error::MalformedFeedback("truncated status chunk"));
            }
            let chunk = PacketChunk::from_word(u16::from_be_bytes([rest[0], rest[1]]));
            covered += chunk.len() as u32;
            chunks.push(chunk);
            rest = &rest[2..];
        }

        // Deltas, one per received status within status_count.
        let mut deltas = Vec::new();
        let symbols = chunks
            .iter()
            .flat_map(|c| (0..c.len()).map(move |i| c.symbol(i)))
            .take(status_count as usize);
        for status in symbols {
            match status {
                PacketStatus::NotReceived | PacketStatus::Reserved => {}
                PacketStatus::ReceivedSmallDelta => {
                    let Some(v) = rest.first() else {
                        return Err(Error::MalformedFeedback("missing small delta"));
                    };
                    deltas.push(Delta::Small(*v));
                    rest = &rest[1..];
                }
                PacketStatus::ReceivedLargeOrNegativeDelta => {
                    if rest.len() < 2 {
                        return Err(Error::MalformedFeedback("missing large delta"));
                    }
                    deltas.push(Delta::Large(i16::from_be_bytes([rest[0], rest[1]])));
                    rest = &rest[2..];
                }
            }
        }

        Ok(Twcc {
            sender_ssrc,
            ssrc,
            base_seq,
            status_count,
            reference_time,
            feedback_count,
            chunks,
            deltas,
        })
    }

    /// Serialize into a complete RTCP packet including the common header.
    pub fn marshal(&self) -> Vec<u8> {
        let payload_len =
            16 + self.chunks.len() * 2 + self.deltas.iter().map(|d| d.byte_len()).sum::<usize>();
        let pad = (4 - payload_len % 4) % 4;
        let total = 4 + payload_len + pad;

        let mut buf = Vec::with_capacity(total);

        let mut byte0 = 0x80 | FMT_TWCC;
        if pad > 0 {
            byte0 |= 0x20;
        }
        buf.push(byte0);
        buf.push(RTPFB);
        buf.extend_from_slice(&((total / 4 - 1) as u16).to_be_bytes());

        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.base_seq.to_be_bytes());
        buf.extend_from_slice(&self.status_count.to_be_bytes());
        buf.extend_from_slice(&self.reference_time.to_be_bytes()[1..4]);
        buf.push(self.feedback_count);

        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.to_word().to_be_bytes());
        }
        for delta in &self.deltas {
            match delta {
                Delta::Small(v) => buf.push(*v),
                Delta::Large(v) => buf.extend_from_slice(&v.to_be_bytes()),
            }
        }

        if pad > 0 {
            for _ in 0..pad - 1 {
                buf.push(0);
            }
            buf.push(pad as u8);
        }

        buf
    }

    /// Iterate the reported sequences with reconstructed arrival times.
    ///
    /// `time_zero` anchors the 24 bit reference time in the local clock,
    /// `extend_from` is the extended sequence number used to unwrap
    /// `base_seq`.
    pub fn iter(&self, time_zero: Instant, extend_from: Option<u64>) -> TwccIter<'_> {
        let base_seq = extend_u16(extend_from, self.base_seq);
        let time = time_zero + REFERENCE_TIME_UNIT * self.reference_time;

        TwccIter {
            twcc: self,
            index: 0,
            chunk: 0,
            chunk_offset: 0,
            delta: 0,
            seq: base_seq,
            time,
        }
    }
}

/// Iterator over `(extended seq, arrival)` pairs of a [`Twcc`] report.
pub struct TwccIter<'a> {
    twcc: &'a Twcc,
    index: usize,
    chunk: usize,
    chunk_offset: u16,
    delta: usize,
    seq: u64,
    time: Instant,
}

impl Iterator for TwccIter<'_> {
    type Item = (SeqNo, Option<Instant>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.twcc.status_count as usize {
            return None;
        }

        let chunk = self.twcc.chunks.get(self.chunk)?;
        let status = chunk.symbol(self.chunk_offset);

        let arrival = match status {
            PacketStatus::NotReceived | PacketStatus::Reserved => None,
            PacketStatus::ReceivedSmallDelta | PacketStatus::ReceivedLargeOrNegativeDelta => {
                let delta = self.twcc.deltas.get(self.delta)?;
                self.delta += 1;

                let micros = delta.micros();
                self.time = if micros >= 0 {
                    self.time + Duration::from_micros(micros as u64)
                } else {
                    self.time.checked_sub(Duration::from_micros(-micros as u64))?
                };
                Some(self.time)
            }
        };

        self.index += 1;
        self.chunk_offset += 1;
        if self.chunk_offset >= chunk.len() {
            self.chunk += 1;
            self.chunk_offset = 0;
        }

        let seq = SeqNo::from(self.seq);
        self.seq += 1;

        Some((seq, arrival))
    }
}

/// Incrementally builds [`Twcc`] reports from observed receptions.
///
/// Sequences must be recorded consecutively; packets that were not received
/// are recorded with `arrival = None`.
#[derive(Debug)]
pub struct TwccBuilder {
    time_zero: Instant,
    feedback_count: u8,
    receipts: Vec<(u16, Option<Instant>)>,
}

impl TwccBuilder {
    pub fn new(time_zero: Instant) -> Self {
        TwccBuilder {
            time_zero,
            feedback_count: 0,
            receipts: Vec::new(),
        }
    }

    pub fn record(&mut self, seq: u16, arrival: Option<Instant>) {
        self.receipts.push((seq, arrival));
    }

    /// Drain recorded receptions into a report. `None` when nothing was
    /// recorded.
    pub fn build(&mut self) -> Option<Twcc> {
        if self.receipts.is_empty() {
            return None;
        }

        let receipts = std::mem::take(&mut self.receipts);
        let base_seq = receipts[0].0;

        // Reference time anchors at the first received arrival, rounded down
        // to the 64 ms grid.
        let first_arrival = receipts.iter().find_map(|(_, a)| *a);
        let reference_time = first_arrival
            .map(|a| {
                let since_zero = a.saturating_duration_since(self.time_zero);
                (since_zero.as_micros() / REFERENCE_TIME_UNIT.as_micros()) as u32 & 0xff_ffff
            })
            .unwrap_or(0);

        let base_time = self.time_zero + REFERENCE_TIME_UNIT * reference_time;

        let mut statuses = Vec::with_capacity(receipts.len());
        let mut deltas = Vec::new();
        let mut prev_time = base_time;

        for (_, arrival) in &receipts {
            let Some(arrival) = arrival else {
                statuses.push(PacketStatus::NotReceived);
                continue;
            };

            let delta_units = TimeDelta::between(*arrival, prev_time).as_micros() / DELTA_UNIT_US;
            let (status, delta) = if (0..=255).contains(&delta_units) {
                (
                    PacketStatus::ReceivedSmallDelta,
                    Delta::Small(delta_units as u8),
                )
            } else if (i16::MIN as i64..=i16::MAX as i64).contains(&delta_units) {
                (
                    PacketStatus::ReceivedLargeOrNegativeDelta,
                    Delta::Large(delta_units as i16),
                )
            } else {
                // Unrepresentable. Report the packet as not received and let
                // a later report cover it.
                statuses.push(PacketStatus::NotReceived);
                continue;
            };

            statuses.push(status);
            deltas.push(delta);
            prev_time = if delta_units >= 0 {
                prev_time + Duration::from_micros((delta_units * DELTA_UNIT_US) as u64)
            } else {
                prev_time - Duration::from_micros((-delta_units * DELTA_UNIT_US) as u64)
            };
        }

        // Run length encode the statuses.
        let mut chunks: Vec<PacketChunk> = Vec::new();
        for status in statuses {
            match chunks.last_mut() {
                Some(PacketChunk::Run(s, n)) if *s == status && *n < 0x1fff => *n += 1,
                _ => chunks.push(PacketChunk::Run(status, 1)),
            }
        }

        let feedback_count = self.feedback_count;
        self.feedback_count = self.feedback_count.wrapping_add(1);

        Some(Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            base_seq,
            status_count: receipts.len() as u16,
            reference_time,
            feedback_count,
            chunks,
            deltas,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn quantized(now: Instant, millis: u64) -> Instant {
        now + Duration::from_millis(millis)
    }

    #[test]
    fn build_marshal_parse_round_trip() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);

        builder.record(10, Some(quantized(now, 100)));
        builder.record(11, Some(quantized(now, 102)));
        builder.record(12, None);
        builder.record(13, Some(quantized(now, 180)));

        let twcc = builder.build().unwrap();
        let wire = twcc.marshal();

        let parsed = Twcc::parse(&wire[4..]).unwrap();
        assert_eq!(parsed, twcc);
    }

    #[test]
    fn iter_reconstructs_arrival_times() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);

        builder.record(0, Some(quantized(now, 100)));
        builder.record(1, Some(quantized(now, 105)));
        builder.record(2, None);
        builder.record(3, Some(quantized(now, 110)));

        let twcc = builder.build().unwrap();
        let acks: Vec<_> = twcc.iter(now, None).collect();

        assert_eq!(acks.len(), 4);
        assert_eq!(acks[0], (0.into(), Some(quantized(now, 100))));
        assert_eq!(acks[1], (1.into(), Some(quantized(now, 105))));
        assert_eq!(acks[2], (2.into(), None));
        assert_eq!(acks[3], (3.into(), Some(quantized(now, 110))));
    }

    #[test]
    fn iter_handles_negative_delta() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);

        // Second packet arrives before the first, reordered on the path.
        builder.record(0, Some(quantized(now, 100)));
        builder.record(1, Some(quantized(now, 90)));

        let twcc = builder.build().unwrap();
        assert!(matches!(twcc.deltas[1], Delta::Large(v) if v < 0));

        let acks: Vec<_> = twcc.iter(now, None).collect();
        assert_eq!(acks[1].1, Some(quantized(now, 90)));
    }

    #[test]
    fn base_seq_unwraps_against_reference() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);

        // Wire seq 2 while the sender is at extended 65_538.
        builder.record(2, Some(quantized(now, 10)));

        let twcc = builder.build().unwrap();
        let acks: Vec<_> = twcc.iter(now, Some(65_537)).collect();

        assert_eq!(acks[0].0, 65_538.into());
    }

    #[test]
    fn parse_rejects_truncated_reports() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);
        builder.record(0, Some(quantized(now, 10)));
        builder.record(1, Some(quantized(now, 11)));

        let twcc = builder.build().unwrap();
        let wire = twcc.marshal();

        // Whole payload missing.
        assert!(Twcc::parse(&wire[4..10]).is_err());

        // Deltas missing.
        let missing_deltas = &wire[4..wire.len() - 4];
        assert!(Twcc::parse(missing_deltas).is_err());
    }

    #[test]
    fn run_length_chunks_cover_large_gaps() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);

        builder.record(0, Some(quantized(now, 10)));
        for seq in 1..100 {
            builder.record(seq, None);
        }
        builder.record(100, Some(quantized(now, 50)));

        let twcc = builder.build().unwrap();
        assert_eq!(twcc.status_count, 101);

        let received: Vec<_> = twcc
            .iter(now, None)
            .filter(|(_, arrival)| arrival.is_some())
            .collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].0, 100.into());
    }
}
