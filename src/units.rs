use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::time::Duration;

/// A data rate in bits per second.
///
/// Backed by a float since the control loop multiplies rates by fractional
/// coefficients on every update.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bitrate(f64);

impl Bitrate {
    pub const ZERO: Self = Bitrate(0.0);
    pub const MAX: Self = Bitrate(f64::MAX);

    pub const fn bps(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    pub const fn kbps(kbps: u64) -> Self {
        Self::bps(kbps * 1_000)
    }

    pub const fn mbps(mbps: u64) -> Self {
        Self::bps(mbps * 1_000_000)
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Bitrate(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: Self) -> Self {
        Bitrate(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Bitrate(self.0.max(other.0))
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::bps(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Bitrate(value)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bits = self.0 * rhs.as_secs_f64();

        DataSize::bytes((bits / 8.0).round() as u64)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1_000.0 {
            write!(f, "{:.0}bit/s", self.0)
        } else if self.0 < 1_000_000.0 {
            write!(f, "{:.3}kbit/s", self.0 / 1_000.0)
        } else if self.0 < 1_000_000_000.0 {
            write!(f, "{:.3}Mbit/s", self.0 / 1_000_000.0)
        } else {
            write!(f, "{:.3}Gbit/s", self.0 / 1_000_000_000.0)
        }
    }
}

/// An amount of data in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSize(u64);

impl DataSize {
    pub const ZERO: Self = DataSize(0);

    pub const fn bytes(bytes: u64) -> Self {
        DataSize(bytes)
    }

    pub fn as_bytes_u64(&self) -> u64 {
        self.0
    }

    pub fn as_bytes_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn as_bits(&self) -> u64 {
        self.0 * 8
    }
}

impl From<usize> for DataSize {
    fn from(value: usize) -> Self {
        DataSize(value as u64)
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, rhs: Self) -> Self::Output {
        DataSize(self.0 + rhs.0)
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for DataSize {
    type Output = DataSize;

    fn sub(self, rhs: Self) -> Self::Output {
        DataSize(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, |acc, s| acc + s)
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        let bits = (self.0 * 8) as f64;

        Bitrate(bits / rhs.as_secs_f64())
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1_000 {
            write!(f, "{}B", self.0)
        } else if self.0 < 1_000_000 {
            write!(f, "{:.3}kB", self.0 as f64 / 1_000.0)
        } else {
            write!(f, "{:.3}MB", self.0 as f64 / 1_000_000.0)
        }
    }
}
