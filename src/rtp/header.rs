use super::{Pt, Ssrc};

/// Header extension values the core cares about.
///
/// The extension id mapping is negotiated out-of-band; by the time a header
/// reaches this crate the values are already resolved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionValues {
    /// Transport-wide congestion control sequence number
    /// (`draft-holmer-rmcat-transport-wide-cc-extensions-01`).
    pub transport_cc: Option<u16>,
}

/// The parts of an RTP header the send path and pacer operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub has_padding: bool,
    pub marker: bool,
    pub payload_type: Pt,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: Ssrc,
    pub ext_vals: ExtensionValues,
}

impl RtpHeader {
    /// The on-wire size of this header in bytes.
    ///
    /// 12 fixed bytes, plus a one-word extension block with one two-byte
    /// extension element (padded to a word boundary) when the transport-cc
    /// extension is present.
    pub fn marshal_size(&self) -> usize {
        let mut size = 12;

        if self.ext_vals.transport_cc.is_some() {
            // 4 bytes extension header, 1 byte element header, 2 bytes
            // sequence number, 1 byte padding.
            size += 8;
        }

        size
    }

    /// Rewrite this header for an RTX retransmission (RFC 4588).
    ///
    /// The payload gets a two-byte original-sequence-number prefix added
    /// separately; here only the header fields change.
    pub fn to_rtx(&self, rtx_ssrc: Ssrc, rtx_pt: Pt, rtx_seq: u16) -> RtpHeader {
        let mut header = self.clone();
        header.ssrc = rtx_ssrc;
        header.payload_type = rtx_pt;
        header.sequence_number = rtx_seq;
        header
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: 2,
            has_padding: false,
            marker: false,
            payload_type: 0.into(),
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0.into(),
            ext_vals: ExtensionValues::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marshal_size_accounts_for_twcc_extension() {
        let mut header = RtpHeader::default();
        assert_eq!(header.marshal_size(), 12);

        header.ext_vals.transport_cc = Some(7);
        assert_eq!(header.marshal_size(), 20);
    }

    #[test]
    fn rtx_rewrite_keeps_timing_fields() {
        let header = RtpHeader {
            sequence_number: 100,
            timestamp: 90_000,
            ssrc: 1.into(),
            payload_type: 96.into(),
            ..Default::default()
        };

        let rtx = header.to_rtx(2.into(), 97.into(), 555);

        assert_eq!(rtx.ssrc, 2.into());
        assert_eq!(rtx.payload_type, 97.into());
        assert_eq!(rtx.sequence_number, 555);
        assert_eq!(rtx.timestamp, 90_000);
    }
}
