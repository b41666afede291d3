//! Mapping the estimated bandwidth onto media sources.
//!
//! Two shapes: an adaptive encoder with a single target knob, or a set of
//! simulcast sources where the allocator picks which pre-encoded layer is
//! active.

use crate::units::Bitrate;
use crate::Error;

/// Share of the transport target handed to video layers; the rest covers
/// audio, RTCP and headroom.
const VIDEO_SHARE: f64 = 0.8;

/// A source with an adjustable encoder target.
pub trait EncoderSource: Send {
    fn set_target_bitrate(&mut self, bitrate: Bitrate);
}

/// A source offering several pre-encoded layers of the same media.
pub trait SimulcastSource: Send {
    /// The available layers, sorted by ascending bitrate. Exactly one is
    /// active at any time.
    fn qualities(&self) -> Vec<Quality>;

    /// Activate the named layer (and deactivate the rest). Activating the
    /// already-active layer is a no-op.
    fn set_quality(&mut self, name: &str) -> Result<(), Error>;
}

/// One simulcast layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Quality {
    pub name: String,
    pub bitrate: Bitrate,
    pub active: bool,
}

/// A switch performed by the allocator. Activating a new layer requires a
/// keyframe from upstream, so switches are surfaced to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSwitch {
    /// Index of the source in the allocator's source list.
    pub source: usize,
    pub quality: String,
}

/// Distributes the target bitrate over the configured sources.
pub enum BitrateAllocator {
    /// Forward the target to a single adaptive encoder.
    Encoder(Box<dyn EncoderSource>),
    /// Choose active simulcast layers so their sum fits the video share of
    /// the target.
    Simulcast(Vec<Box<dyn SimulcastSource>>),
}

impl BitrateAllocator {
    /// Apply a target bitrate. Idempotent: applying the same target twice
    /// yields no further switches.
    pub fn set_target_bitrate(&mut self, target: Bitrate) -> Result<Vec<LayerSwitch>, Error> {
        match self {
            BitrateAllocator::Encoder(source) => {
                source.set_target_bitrate(target);
                Ok(Vec::new())
            }
            BitrateAllocator::Simulcast(sources) => allocate_simulcast(sources, target),
        }
    }
}

fn active_sum(sources: &[Box<dyn SimulcastSource>]) -> f64 {
    sources
        .iter()
        .flat_map(|s| s.qualities())
        .filter(|q| q.active)
        .map(|q| q.bitrate.as_f64())
        .sum()
}

fn allocate_simulcast(
    sources: &mut [Box<dyn SimulcastSource>],
    target: Bitrate,
) -> Result<Vec<LayerSwitch>, Error> {
    let target_video = target.as_f64() * VIDEO_SHARE;
    let mut current = active_sum(sources);
    let mut switches = Vec::new();

    // Raise the cheapest upgradable active layer while the sum still fits.
    loop {
        let mut candidate: Option<(usize, usize)> = None;
        let mut candidate_bitrate = f64::MAX;

        for (i, source) in sources.iter().enumerate() {
            let qualities = source.qualities();
            for (j, quality) in qualities.iter().enumerate() {
                let has_higher = j + 1 < qualities.len();
                if quality.active && has_higher && quality.bitrate.as_f64() < candidate_bitrate {
                    candidate_bitrate = quality.bitrate.as_f64();
                    candidate = Some((i, j));
                }
            }
        }

        let Some((i, j)) = candidate else {
            break;
        };

        let qualities = sources[i].qualities();
        let next = &qualities[j + 1];
        let difference = next.bitrate.as_f64() - candidate_bitrate;
        if current + difference > target_video {
            break;
        }

        debug!("Raising source {} to {}", i, next.name);
        sources[i].set_quality(&next.name)?;
        switches.push(LayerSwitch {
            source: i,
            quality: next.name.clone(),
        });
        current += difference;
    }

    // Lower the most expensive downgradable active layer while the sum
    // exceeds the target and the step down does not undershoot it.
    while current > target_video {
        let mut candidate: Option<(usize, usize)> = None;
        let mut candidate_bitrate = 0.0_f64;

        for (i, source) in sources.iter().enumerate() {
            let qualities = source.qualities();
            for (j, quality) in qualities.iter().enumerate() {
                if j > 0 && quality.active && quality.bitrate.as_f64() > candidate_bitrate {
                    candidate_bitrate = quality.bitrate.as_f64();
                    candidate = Some((i, j));
                }
            }
        }

        let Some((i, j)) = candidate else {
            break;
        };

        let qualities = sources[i].qualities();
        let next = &qualities[j - 1];
        let difference = next.bitrate.as_f64() - candidate_bitrate;
        if current + difference < target_video {
            break;
        }

        debug!("Lowering source {} to {}", i, next.name);
        sources[i].set_quality(&next.name)?;
        switches.push(LayerSwitch {
            source: i,
            quality: next.name.clone(),
        });
        current += difference;
    }

    Ok(switches)
}
