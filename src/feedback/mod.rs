//! Correlation of outgoing RTP with transport-wide feedback.
//!
//! The [`FeedbackAdapter`] keeps a history of sent packets and, for every
//! incoming [`Twcc`] or [`CcfbReport`], produces the list of
//! [`Acknowledgment`]s the estimators consume.

use std::time::{Duration, Instant};

use crate::time::TimeDelta;
use crate::Error;

mod adapter;
mod ccfb;
mod ntp;
mod twcc;

pub use adapter::{Acknowledgment, FeedbackAdapter};
pub use ccfb::{CcfbReport, PacketMetric, SsrcBlock};
pub use ntp::{duration_to_ntp_short, ntp_short_to_duration};
pub use twcc::{Delta, PacketChunk, PacketStatus, Twcc, TwccBuilder, TwccIter};

/// ECN marking reported for a received packet.
///
/// Parsed and carried, but not acted upon by the controllers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Ecn {
    #[default]
    NotEct = 0b00,
    Ect1 = 0b01,
    Ect0 = 0b10,
    Ce = 0b11,
}

impl From<u8> for Ecn {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }
}

/// A parsed transport feedback packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    TransportCc(Twcc),
    Ccfb(CcfbReport),
}

/// Parse an RTCP transport layer feedback packet.
///
/// Dispatches on payload type and feedback message type; only
/// `TransportLayerCC` (205/15) and `CCFeedbackReport` (205/11) are handled.
pub fn parse_feedback(buf: &[u8]) -> Result<Feedback, Error> {
    if buf.len() < 8 {
        return Err(Error::MalformedFeedback("truncated rtcp header"));
    }

    let version = buf[0] >> 6;
    if version != 2 {
        return Err(Error::MalformedFeedback("bad rtcp version"));
    }

    let has_padding = buf[0] & 0x20 != 0;
    let fmt = buf[0] & 0x1f;
    let pt = buf[1];

    let length_words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let total = (length_words + 1) * 4;
    if buf.len() < total {
        return Err(Error::MalformedFeedback("rtcp length beyond buffer"));
    }

    let mut payload = &buf[4..total];
    if has_padding {
        let pad = *payload.last().unwrap_or(&0) as usize;
        if pad == 0 || pad > payload.len() {
            return Err(Error::MalformedFeedback("bad rtcp padding"));
        }
        payload = &payload[..payload.len() - pad];
    }

    match (pt, fmt) {
        (twcc::RTPFB, twcc::FMT_TWCC) => Ok(Feedback::TransportCc(Twcc::parse(payload)?)),
        (twcc::RTPFB, ccfb::FMT_CCFB) => Ok(Feedback::Ccfb(CcfbReport::parse(payload)?)),
        _ => Err(Error::MalformedFeedback("unsupported feedback type")),
    }
}

/// Round trip time derived from one feedback report.
///
/// The receiver holds each acknowledgment for a while before the report goes
/// out; that pending time is subtracted so the result approximates pure
/// network RTT: `(now − departure) − (report_sent − arrival)`, minimized over
/// the acked packets.
pub fn feedback_rtt(
    now: Instant,
    feedback_sent_time: Instant,
    acks: &[Acknowledgment],
) -> Option<Duration> {
    acks.iter()
        .filter_map(|ack| {
            let arrival = ack.arrival?;
            let pending = TimeDelta::between(feedback_sent_time, arrival);
            let rtt = TimeDelta::between(now, ack.departure) - pending;

            (!rtt.is_negative()).then(|| Duration::from_micros(rtt.as_micros() as u64))
        })
        .min()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_dispatches_on_fmt() {
        let now = Instant::now();
        let mut builder = TwccBuilder::new(now);
        builder.record(0, Some(now + Duration::from_millis(5)));
        let twcc = builder.build().unwrap();

        let parsed = parse_feedback(&twcc.marshal()).unwrap();
        assert!(matches!(parsed, Feedback::TransportCc(_)));

        let ccfb = CcfbReport {
            sender_ssrc: 1.into(),
            blocks: vec![],
            report_timestamp: 0,
        };
        let parsed = parse_feedback(&ccfb.marshal()).unwrap();
        assert!(matches!(parsed, Feedback::Ccfb(_)));
    }

    #[test]
    fn parse_rejects_unknown_types() {
        // A receiver report (PT 201).
        let buf = [0x80, 201, 0, 1, 0, 0, 0, 1];
        assert!(parse_feedback(&buf).is_err());

        // Garbage.
        assert!(parse_feedback(&[0, 1, 2]).is_err());
    }

    #[test]
    fn rtt_subtracts_receiver_pending_time() {
        let base = Instant::now();

        let acks = vec![Acknowledgment {
            seq: 1.into(),
            size: 1200_usize.into(),
            departure: base,
            arrival: Some(base + Duration::from_millis(30)),
            ecn: Ecn::NotEct,
        }];

        // Departure at 0, arrival at 30 ms. The report sat 50 ms at the
        // receiver (sent at 80 ms) and reached us at 100 ms:
        // rtt = 100 - 50 = 50 ms.
        let report_sent = base + Duration::from_millis(80);
        let now = base + Duration::from_millis(100);

        let rtt = feedback_rtt(now, report_sent, &acks).unwrap();
        assert_eq!(rtt, Duration::from_millis(50));
    }
}
