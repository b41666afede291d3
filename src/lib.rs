//! Send-side bandwidth estimation and pacing core for RTP transports.
//!
//! This crate is the congestion control heart of a real-time media testbed:
//! it observes transport-wide feedback (TWCC or RFC 8888) for outgoing RTP,
//! estimates the available path capacity with a GCC-style delay/loss
//! estimator pair, paces outgoing media to the estimate with a token bucket
//! that fills the gap with RTX padding, and allocates the resulting budget
//! over media sources (an adaptive encoder or a simulcast layer selector).
//!
//! The main entry point is [`Session`], which wires the pieces together and
//! runs the pacer and allocator workers. The individual subsystems are usable
//! on their own:
//!
//! - [`feedback::FeedbackAdapter`] correlates sent packets with feedback
//!   reports into per-packet [`feedback::Acknowledgment`]s.
//! - [`bwe::BandwidthEstimator`] turns acknowledgment batches into a target
//!   bitrate.
//! - [`pacer::Pacer`] smooths outgoing RTP and emits round-robin RTX padding.
//! - [`allocator::BitrateAllocator`] maps the target onto codec knobs or
//!   simulcast layers.
//!
//! All estimator APIs are driven by explicit `now: Instant` arguments so the
//! control loop is deterministic and testable; only the workers consult the
//! wall clock.

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

use std::io;

use thiserror::Error;

mod macros;

pub mod allocator;
pub mod bwe;
mod config;
pub mod feedback;
pub mod pacer;
pub mod rtp;
mod session;
mod time;
mod units;
mod util;

pub use config::Config;
pub use session::{MediaWriter, Session};
pub use time::TimeDelta;
pub use units::{Bitrate, DataSize};

/// Errors arising in the estimation and pacing pipeline.
///
/// Runtime errors are local: a malformed report or a failed write never
/// poisons estimator state. Only [`Error::InvalidConfig`] is fatal, and only
/// at construction time.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation at construction.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An outgoing RTP header carried no transport-wide sequence number.
    #[error("rtp header lacks transport-cc extension")]
    MissingTwccExtension,

    /// An incoming feedback report could not be parsed.
    #[error("malformed feedback: {0}")]
    MalformedFeedback(&'static str),

    /// The underlying writer for a paced stream is closed.
    #[error("rtp writer closed")]
    WriterClosed,

    /// A simulcast source was asked for a quality it doesn't have.
    #[error("no such quality: {0}")]
    UnknownQuality(String),

    /// Io errors from the wire writer.
    #[error("{0}")]
    Io(#[from] io::Error),
}
