//! Block geometry for the mixed timeline
//!
//! Pure functions mapping tracks onto fixed-duration blocks. The loader uses
//! these to decide which source samples land where in a block.

use crate::model::MixTrack;
use crate::types::{seconds_to_samples, StereoSample, BLOCK_DURATION, INTERNAL_SAMPLE_RATE,
    RECORD_BUFFER_DURATION, RECORD_BUFFER_MARGIN};

/// Engine timing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Internal (timeline) sample rate
    pub sample_rate: u32,
    /// Seconds per block
    pub block_duration: f64,
    pub record_buffer_duration: f64,
    pub record_buffer_margin: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            sample_rate: INTERNAL_SAMPLE_RATE,
            block_duration: BLOCK_DURATION,
            record_buffer_duration: RECORD_BUFFER_DURATION,
            record_buffer_margin: RECORD_BUFFER_MARGIN,
        }
    }
}

impl Timing {
    /// Samples per block at the internal rate
    pub fn block_samples(&self) -> usize {
        seconds_to_samples(self.block_duration, self.sample_rate).max(1)
    }

    /// Block containing timeline sample `position`
    pub fn block_at(&self, position: f64) -> usize {
        if position <= 0.0 {
            0
        } else {
            (position / self.block_samples() as f64) as usize
        }
    }

    /// Number of blocks needed to cover `len` samples
    pub fn block_count(&self, len: usize) -> usize {
        len.div_ceil(self.block_samples())
    }
}

/// Where a non-repeating track's samples go within one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRegion {
    /// First destination sample, relative to the block start
    pub dst_start: usize,
    /// Frames to copy
    pub count: usize,
    /// First source sample in the reader
    pub src_start: usize,
}

/// Overlap of a non-repeating track with `block`
///
/// `reader_len` is the decoded source length in samples at `timing.sample_rate`.
/// Returns `None` when the track contributes nothing to the block.
pub fn block_region(timing: &Timing, block: usize, track: &MixTrack, reader_len: usize) -> Option<ReadRegion> {
    let rate = timing.sample_rate as f64;
    let block_len = timing.block_samples();
    let block_duration = block_len as f64 / rate;
    let block_start = block as f64 * block_duration;
    let block_end = block_start + block_duration;

    if track.offset > block_end {
        return None;
    }
    let track_duration = track.effective_duration(reader_len as f64 / rate);
    if track.offset + track_duration < block_start {
        return None;
    }

    let diff = track.offset - block_start;
    let dst_start = (diff.clamp(0.0, block_duration) * rate).round() as usize;
    let src_start = (((-diff).max(0.0) + track.from_time) * rate).round() as usize;
    let leftover = ((track.offset + track_duration - block_start) * rate).round();

    let mut count = block_len;
    count = count.min(reader_len.saturating_sub(src_start));
    count = count.min(block_len.saturating_sub(dst_start));
    if leftover <= 0.0 {
        return None;
    }
    count = count.min(leftover as usize);

    if count == 0 {
        return None;
    }
    Some(ReadRegion {
        dst_start,
        count,
        src_start,
    })
}

/// Add every repetition of `source` overlapping the block into `out`
///
/// Repetitions start at `offset + k * interval` samples for k = 0, 1, ...
/// and each plays the whole source. An interval of 0 places a single copy.
/// Overlapping repetitions are summed.
pub fn tile_repeats(block_start: usize, out: &mut [StereoSample], source: &[StereoSample], offset: usize, interval: usize) {
    let out_len = out.len();
    let block_end = block_start + out_len;
    let track_len = source.len();
    if track_len == 0 {
        return;
    }

    let mut k = 0usize;
    loop {
        let repeat_start = offset + k * interval;
        if repeat_start >= block_end {
            break;
        }
        if repeat_start + track_len > block_start {
            let write_pos = repeat_start as isize - block_start as isize;
            let read_pos = if write_pos < 0 { (-write_pos) as usize } else { 0 };
            let dst = write_pos.max(0) as usize;
            let n = (track_len - read_pos).min(out_len - dst);
            for (o, s) in out[dst..dst + n].iter_mut().zip(&source[read_pos..read_pos + n]) {
                *o += *s;
            }
        }
        if interval == 0 {
            break;
        }
        k += 1;
    }
}
