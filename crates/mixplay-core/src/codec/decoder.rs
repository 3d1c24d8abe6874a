//! Track decoding with Symphonia
//!
//! Tracks are decoded completely when opened and converted to the internal
//! sample rate, so every reader the engine sees is already at timeline rate
//! and reads are plain memory copies.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{TrackDecoder, TrackReader};
use crate::dsp::resample_channels;
use crate::error::DecodeError;
use crate::types::{StereoBuffer, StereoSample};

/// Reader over a fully decoded stereo buffer
#[derive(Debug, Clone)]
pub struct MemoryReader {
    samples: StereoBuffer,
    sample_rate: u32,
}

impl MemoryReader {
    pub fn new(samples: StereoBuffer, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &StereoBuffer {
        &self.samples
    }
}

impl TrackReader for MemoryReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn read(&self, dest: &mut StereoBuffer, dest_offset: usize, count: usize, src_offset: usize) -> bool {
        let Some(dest_end) = dest_offset.checked_add(count) else {
            return false;
        };
        if dest_end > dest.len() {
            return false;
        }

        let available = self.samples.len().saturating_sub(src_offset).min(count);
        let out = &mut dest.as_mut_slice()[dest_offset..dest_end];
        if available > 0 {
            out[..available].copy_from_slice(&self.samples.as_slice()[src_offset..src_offset + available]);
        }
        out[available..].fill(StereoSample::silence());
        true
    }
}

/// Decoder backed by Symphonia's format probe and codec registry
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    target_rate: u32,
}

impl SymphoniaDecoder {
    /// Create a decoder producing readers at `target_rate`
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    /// Decode a whole file to stereo at its native rate
    pub fn decode_file(path: &Path) -> Result<(StereoBuffer, u32), DecodeError> {
        let file = File::open(path).map_err(|e| DecodeError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let unsupported = |reason: String| DecodeError::Unsupported {
            path: path.to_path_buf(),
            reason,
        };

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::NoAudioTrack(path.to_path_buf()))?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;
        let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;

        let mut interleaved: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    log::warn!("decode {:?}: error reading packet: {}", path, e);
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!("decode {:?}: error decoding packet: {}", path, e);
                    continue;
                }
            };

            if sample_buf.is_none() {
                let spec = *decoded.spec();
                channels = spec.channels.count();
                sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }

            if let Some(ref mut buf) = sample_buf {
                buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buf.samples());
            }
        }

        Ok((to_stereo(&interleaved, channels), sample_rate))
    }
}

impl TrackDecoder for SymphoniaDecoder {
    fn open(&self, path: &Path) -> Result<Arc<dyn TrackReader>, DecodeError> {
        let (samples, native_rate) = Self::decode_file(path)?;

        let samples = if native_rate != self.target_rate && !samples.is_empty() {
            log::debug!(
                "decode {:?}: resampling {}Hz -> {}Hz",
                path,
                native_rate,
                self.target_rate
            );
            let (left, right) = samples.to_channels();
            let resampled = resample_channels(&[left, right], native_rate, self.target_rate)
                .map_err(|e| DecodeError::Resample(e.to_string()))?;
            StereoBuffer::from_channels(&resampled[0], &resampled[1])
        } else {
            samples
        };

        log::info!(
            "Opened {:?}: {} samples @ {}Hz",
            path,
            samples.len(),
            self.target_rate
        );
        Ok(Arc::new(MemoryReader::new(samples, self.target_rate)))
    }
}

/// Fold interleaved audio with any channel count into stereo
///
/// Mono is duplicated to both sides; channels beyond the first two are dropped.
fn to_stereo(interleaved: &[f32], channels: usize) -> StereoBuffer {
    match channels {
        0 => StereoBuffer::default(),
        1 => StereoBuffer::from_vec(interleaved.iter().map(|&s| StereoSample::mono(s)).collect()),
        2 => StereoBuffer::from_interleaved(interleaved),
        n => StereoBuffer::from_vec(
            interleaved
                .chunks_exact(n)
                .map(|frame| StereoSample::new(frame[0], frame[1]))
                .collect(),
        ),
    }
}
