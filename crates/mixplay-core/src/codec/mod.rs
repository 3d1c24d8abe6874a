//! Decoder and encoder capabilities
//!
//! The engine only talks to the traits in this module. Concrete adapters:
//! - [`SymphoniaDecoder`]: any format symphonia can probe, decoded into memory
//! - [`FileEncoder`]: WAV (hound) or FLAC (flacenc), chosen by file extension

mod decoder;
mod encoder;

use std::path::Path;
use std::sync::Arc;

use crate::error::{DecodeError, EncodeError};
use crate::types::StereoBuffer;

pub use decoder::{MemoryReader, SymphoniaDecoder};
pub use encoder::{FileEncoder, FlacFileWriter, OutputFormat, WavFileWriter};

/// Random-access reader over one decoded track
pub trait TrackReader: Send + Sync {
    /// Sample rate of the samples returned by `read`
    fn sample_rate(&self) -> u32;

    /// Length in samples (frames)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `count` frames starting at `src_offset` into `dest[dest_offset..]`
    ///
    /// Frames past the end of the source are written as silence. Returns
    /// false when the destination range does not fit in `dest`.
    fn read(&self, dest: &mut StereoBuffer, dest_offset: usize, count: usize, src_offset: usize) -> bool;
}

/// Opens track readers for file paths
pub trait TrackDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn TrackReader>, DecodeError>;
}

/// Format of a file being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl OutputSpec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }
}

/// Sink for encoded audio
pub trait AudioWriter: Send {
    /// Append planar samples; every channel slice has the same length
    fn write(&mut self, channels: &[&[f32]]) -> Result<(), EncodeError>;

    /// Push buffered data to the file
    fn flush(&mut self) -> Result<(), EncodeError>;

    /// Complete the file (headers, trailing frames)
    fn finalize(self: Box<Self>) -> Result<(), EncodeError>;
}

/// Creates writers for output paths
pub trait AudioEncoder: Send + Sync {
    fn create(&self, path: &Path, spec: OutputSpec) -> Result<Box<dyn AudioWriter>, EncodeError>;
}

/// Convert a float sample to 16-bit PCM
#[inline]
pub(crate) fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
