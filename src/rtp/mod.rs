//! Minimal RTP surface needed by the estimation and pacing core.
//!
//! The packetizer itself is an external collaborator; the core only needs
//! header metadata (sizes, SSRC, the transport-wide sequence extension) and
//! the RTX rewrite used for padding.

mod header;
mod id;

pub use header::{ExtensionValues, RtpHeader};
pub use id::{Pt, SeqNo, Ssrc};

/// Extend a 16 bit sequence number to 64 bits using a previously extended
/// value as reference.
///
/// The result is chosen so the distance to the reference stays inside half
/// the 16 bit range, which makes the extension monotone for non-reordered
/// input (RFC 3711 appendix A roll-over counter logic).
pub(crate) fn extend_u16(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    const MAX: u64 = u16::MAX as u64 + 1;
    const HALF: u64 = MAX / 2;

    let seq = seq as u64;

    let Some(prev_index) = prev_ext_seq else {
        // No reference, this is the first value seen.
        return seq;
    };

    let roc = (prev_index >> 16) as i64;
    let prev_seq = prev_index & (MAX - 1);

    let v = if prev_seq < HALF {
        if seq > HALF + prev_seq {
            roc - 1
        } else {
            roc
        }
    } else if prev_seq > seq + HALF {
        roc + 1
    } else {
        roc
    };

    if v < 0 {
        return 0;
    }

    (v as u64) * MAX + seq
}
