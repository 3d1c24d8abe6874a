//! WAV and FLAC writers
//!
//! WAV is streamed through hound. flacenc encodes a complete stream at once,
//! so FLAC samples are buffered in memory and encoded on finalize.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flacenc::component::BitRepr;
use flacenc::error::Verify;

use super::{to_i16, AudioEncoder, AudioWriter, OutputSpec};
use crate::error::EncodeError;

/// Container chosen from the output file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Wav,
    Flac,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "wav" => Some(OutputFormat::Wav),
            "flac" => Some(OutputFormat::Flac),
            _ => None,
        }
    }
}

/// Encoder that picks WAV or FLAC by extension
#[derive(Debug, Clone, Copy, Default)]
pub struct FileEncoder;

impl AudioEncoder for FileEncoder {
    fn create(&self, path: &Path, spec: OutputSpec) -> Result<Box<dyn AudioWriter>, EncodeError> {
        match OutputFormat::from_path(path) {
            Some(OutputFormat::Wav) => Ok(Box::new(WavFileWriter::create(path, spec)?)),
            Some(OutputFormat::Flac) => Ok(Box::new(FlacFileWriter::create(path, spec)?)),
            None => Err(EncodeError::UnsupportedExtension(path.to_path_buf())),
        }
    }
}

fn check_channels(channels: &[&[f32]], expected: u16) -> Result<usize, EncodeError> {
    if channels.len() != expected as usize {
        return Err(EncodeError::Write(format!(
            "expected {} channels, got {}",
            expected,
            channels.len()
        )));
    }
    let frames = channels.first().map(|c| c.len()).unwrap_or(0);
    if channels.iter().any(|c| c.len() != frames) {
        return Err(EncodeError::Write("channel lengths differ".to_string()));
    }
    Ok(frames)
}

// ─────────────────────────────────────────────────────────────────────────────
// WAV
// ─────────────────────────────────────────────────────────────────────────────

/// 16-bit PCM WAV writer
pub struct WavFileWriter {
    writer: hound::WavWriter<BufWriter<File>>,
    channels: u16,
}

impl WavFileWriter {
    pub fn create(path: &Path, spec: OutputSpec) -> Result<Self, EncodeError> {
        let wav_spec = hound::WavSpec {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, wav_spec).map_err(|e| EncodeError::Create {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            writer,
            channels: spec.channels,
        })
    }
}

impl AudioWriter for WavFileWriter {
    fn write(&mut self, channels: &[&[f32]]) -> Result<(), EncodeError> {
        let frames = check_channels(channels, self.channels)?;
        for i in 0..frames {
            for channel in channels {
                self.writer
                    .write_sample(to_i16(channel[i]))
                    .map_err(|e| EncodeError::Write(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncodeError> {
        self.writer.flush().map_err(|e| EncodeError::Write(e.to_string()))
    }

    fn finalize(self: Box<Self>) -> Result<(), EncodeError> {
        self.writer.finalize().map_err(|e| EncodeError::Write(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FLAC
// ─────────────────────────────────────────────────────────────────────────────

/// 16-bit FLAC writer
///
/// Holds every sample in memory (4 bytes per sample per channel) and writes
/// nothing to disk before [`AudioWriter::finalize`]. A recording that is
/// never finalized leaves an empty file; use WAV when partial output has to
/// survive a crash.
pub struct FlacFileWriter {
    file: File,
    path: PathBuf,
    spec: OutputSpec,
    /// Interleaved samples awaiting encode
    samples: Vec<i32>,
}

impl FlacFileWriter {
    pub fn create(path: &Path, spec: OutputSpec) -> Result<Self, EncodeError> {
        let file = File::create(path).map_err(|e| EncodeError::Create {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            spec,
            samples: Vec::new(),
        })
    }
}

impl AudioWriter for FlacFileWriter {
    fn write(&mut self, channels: &[&[f32]]) -> Result<(), EncodeError> {
        let frames = check_channels(channels, self.spec.channels)?;
        self.samples.reserve(frames * channels.len());
        for i in 0..frames {
            for channel in channels {
                self.samples.push(to_i16(channel[i]) as i32);
            }
        }
        Ok(())
    }

    /// No-op: the stream is only encoded on finalize
    fn flush(&mut self) -> Result<(), EncodeError> {
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<(), EncodeError> {
        let config = flacenc::config::Encoder::default()
            .into_verified()
            .map_err(|(_, e)| EncodeError::Write(format!("flac config: {:?}", e)))?;
        let source = flacenc::source::MemSource::from_samples(
            &self.samples,
            self.spec.channels as usize,
            self.spec.bits_per_sample as usize,
            self.spec.sample_rate as usize,
        );
        let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
            .map_err(|e| EncodeError::Write(format!("flac encode: {:?}", e)))?;

        let mut sink = flacenc::bitsink::ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|e| EncodeError::Write(format!("flac write: {:?}", e)))?;

        self.file
            .write_all(sink.as_slice())
            .and_then(|_| self.file.flush())
            .map_err(|e| EncodeError::Write(e.to_string()))?;
        log::debug!("Wrote {} FLAC bytes to {:?}", sink.as_slice().len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a/b.WAV")), Some(OutputFormat::Wav));
        assert_eq!(OutputFormat::from_path(Path::new("b.flac")), Some(OutputFormat::Flac));
        assert_eq!(OutputFormat::from_path(Path::new("b.mp3")), None);
        assert_eq!(OutputFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileEncoder.create(&dir.path().join("out.ogg"), OutputSpec::new(48000, 1));
        assert!(matches!(result, Err(EncodeError::UnsupportedExtension(_))));
    }

    #[test]
    fn test_wav_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut writer = FileEncoder.create(&path, OutputSpec::new(44100, 2)).unwrap();
        let left = [0.5f32; 100];
        let right = [-0.5f32; 100];
        writer.write(&[&left, &right]).unwrap();
        writer.flush().unwrap();
        writer.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44100);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 200);
        assert_eq!(samples[0], to_i16(0.5));
        assert_eq!(samples[1], to_i16(-0.5));
    }

    #[test]
    fn test_channel_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileEncoder.create(&dir.path().join("mono.wav"), OutputSpec::new(48000, 1)).unwrap();
        let data = [0.0f32; 4];
        assert!(writer.write(&[&data, &data]).is_err());
    }

    #[test]
    fn test_flac_writer_produces_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.flac");

        let mut writer = FileEncoder.create(&path, OutputSpec::new(48000, 1)).unwrap();
        let tone: Vec<f32> = (0..9600).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        writer.write(&[&tone]).unwrap();
        writer.flush().unwrap();
        // Buffered until finalize
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        writer.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"fLaC");
    }
}
