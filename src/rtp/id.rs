use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($(#[$doc:meta])* $id:ident, $t:tt) => {
        $(#[$doc])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $id($t);

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

num_id!(
    /// Synchronization source identifying an RTP stream.
    Ssrc,
    u32
);

num_id!(
    /// RTP payload type.
    Pt,
    u8
);

num_id!(
    /// Transport-wide sequence number, extended to 64 bits.
    ///
    /// On the wire the TWCC extension carries 16 bits; the core tracks roll
    /// overs and works with the extended value throughout.
    SeqNo,
    u64
);

impl SeqNo {
    /// The 16 bit wire representation (discarding roll overs).
    pub fn as_u16(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Increase this sequence number, returning the previous value.
    pub fn inc(&mut self) -> SeqNo {
        let n = SeqNo(self.0);
        self.0 += 1;
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seq_no_wire_form() {
        let seq: SeqNo = 65_537.into();
        assert_eq!(seq.as_u16(), 1);
    }

    #[test]
    fn seq_no_inc() {
        let mut seq: SeqNo = 9.into();
        assert_eq!(seq.inc(), 9.into());
        assert_eq!(seq, 10.into());
    }
}
