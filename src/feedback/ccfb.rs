use std::time::Duration;

use crate::rtp::Ssrc;
use crate::Error;

use super::Ecn;
use super::twcc::RTPFB;

/// Feedback message type for RFC 8888 congestion control feedback.
pub(crate) const FMT_CCFB: u8 = 11;

/// Arrival time offsets are in 1/1024 s units.
const ATO_UNIT_NS: u64 = 1_000_000_000 / 1024;
/// ATO value meaning the offset was too large to represent.
const ATO_UNREPRESENTABLE: u16 = 0x1fff;

/// RFC 8888 congestion control feedback report.
///
/// Unlike TWCC the sequence numbers are per-SSRC RTP sequence numbers, and
/// arrival times are encoded as offsets before the report timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfbReport {
    pub sender_ssrc: Ssrc,
    pub blocks: Vec<SsrcBlock>,
    /// NTP short format (upper 32 bits of a 64 bit NTP timestamp): 16 bit
    /// seconds, 16 bit fraction.
    pub report_timestamp: u32,
}

/// Per-SSRC metric block of a [`CcfbReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcBlock {
    pub ssrc: Ssrc,
    /// First RTP sequence number covered.
    pub begin_seq: u16,
    /// One metric per sequence number starting at `begin_seq`.
    pub metrics: Vec<PacketMetric>,
}

/// Reception metric for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetric {
    pub received: bool,
    pub ecn: Ecn,
    /// How long before the report timestamp the packet arrived. `None` for
    /// lost packets and for arrivals too old to represent.
    pub arrival_offset: Option<Duration>,
}

impl PacketMetric {
    pub fn lost() -> Self {
        PacketMetric {
            received: false,
            ecn: Ecn::NotEct,
            arrival_offset: None,
        }
    }

    pub fn received(ecn: Ecn, arrival_offset: Duration) -> Self {
        PacketMetric {
            received: true,
            ecn,
            arrival_offset: Some(arrival_offset),
        }
    }

    fn to_word(self) -> u16 {
        if !self.received {
            return 0;
        }

        let ato = match self.arrival_offset {
            Some(offset) => {
                let units = offset.as_nanos() as u64 / ATO_UNIT_NS;
                (units as u16).min(ATO_UNREPRESENTABLE - 1)
            }
            None => ATO_UNREPRESENTABLE,
        };

        1 << 15 | (self.ecn as u16) << 13 | ato
    }

    fn from_word(word: u16) -> Self {
        let received = word & 1 << 15 != 0;
        if !received {
            return PacketMetric::lost();
        }

        let ecn = Ecn::from((word >> 13) as u8 & 0b11);
        let ato = word & 0x1fff;
        let arrival_offset = if ato == ATO_UNREPRESENTABLE {
            None
        } else {
            Some(Duration::from_nanos(ato as u64 * ATO_UNIT_NS))
        };

        PacketMetric {
            received,
            ecn,
            arrival_offset,
        }
    }
}

impl CcfbReport {
    /// Parse the feedback payload (after the 4 byte RTCP header).
    pub fn parse(buf: &[u8]) -> Result<CcfbReport, Error> {
        if buf.len() < 8 {
            return Err(Error::MalformedFeedback("truncated ccfb report"));
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        // The report timestamp is the last word of the packet; metric blocks
        // fill the space in between.
        let rts_offset = buf.len() - 4;
        let report_timestamp = u32::from_be_bytes([
            buf[rts_offset],
            buf[rts_offset + 1],
            buf[rts_offset + 2],
            buf[rts_offset + 3],
        ]);

        let mut rest = &buf[4..rts_offset];
        let mut blocks = Vec::new();

        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(Error::MalformedFeedback("truncated ccfb block header"));
            }

            let ssrc = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]).into();
            let begin_seq = u16::from_be_bytes([rest[4], rest[5]]);
            let num_reports = u16::from_be_bytes([rest[6], rest[7]]) as usize;
            rest = &rest[8..];

            // Metric words are padded to a 32 bit boundary.
            let padded = num_reports + num_reports % 2;
            if rest.len() < padded * 2 {
                return Err(Error::MalformedFeedback("truncated ccfb metrics"));
            }

            let mut metrics = Vec::with_capacity(num_reports);
            for i in 0..num_reports {
                let word = u16::from_be_bytes([rest[i * 2], rest[i * 2 + 1]]);
                metrics.push(PacketMetric::from_word(word));
            }
            rest = &rest[padded * 2..];

            blocks.push(SsrcBlock {
                ssrc,
                begin_seq,
                metrics,
            });
        }

        Ok(CcfbReport {
            sender_ssrc,
            blocks,
            report_timestamp,
        })
    }

    /// Serialize into a complete RTCP packet including the common header.
    pub fn marshal(&self) -> Vec<u8> {
        let blocks_len: usize = self
            .blocks
            .iter()
            .map(|b| 8 + (b.metrics.len() + b.metrics.len() % 2) * 2)
            .sum();
        let total = 4 + 4 + blocks_len + 4;

        let mut buf = Vec::with_capacity(total);

        buf.push(0x80 | FMT_CCFB);
        buf.push(RTPFB);
        buf.extend_from_slice(&((total / 4 - 1) as u16).to_be_bytes());
        buf.extend_from_slice(&self.sender_ssrc.to_be_bytes());

        for block in &self.blocks {
            buf.extend_from_slice(&block.ssrc.to_be_bytes());
            buf.extend_from_slice(&block.begin_seq.to_be_bytes());
            buf.extend_from_slice(&(block.metrics.len() as u16).to_be_bytes());
            for metric in &block.metrics {
                buf.extend_from_slice(&metric.to_word().to_be_bytes());
            }
            if block.metrics.len() % 2 == 1 {
                buf.extend_from_slice(&[0, 0]);
            }
        }

        buf.extend_from_slice(&self.report_timestamp.to_be_bytes());

        buf
    }
}
