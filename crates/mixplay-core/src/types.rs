//! Common types for mixplay
//!
//! Fundamental audio types shared by the loader, the real-time callback and
//! the codecs: stereo sample and buffer handling plus the engine timing
//! constants.

use std::ops::{Index, IndexMut};

/// Internal sample rate of the mixed timeline (48kHz)
///
/// Every track is converted to this rate when opened, and the play buffer is
/// always stored at this rate regardless of the device rate.
pub const INTERNAL_SAMPLE_RATE: u32 = 48000;

/// Duration of one play buffer block in seconds
pub const BLOCK_DURATION: f64 = 5.0;

/// Seconds of input captured per record buffer before it is flushed
pub const RECORD_BUFFER_DURATION: f64 = 10.0;

/// Headroom factor applied to record buffer capacity
///
/// The flush threshold is checked after each callback, so a buffer may
/// overshoot its nominal duration by up to one device block.
pub const RECORD_BUFFER_MARGIN: f64 = 1.5;

/// Audio sample type (32-bit float for processing)
pub type Sample = f32;

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This lets decoded interleaved `&[f32]` be reinterpreted as
/// `&[StereoSample]` with bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo samples
///
/// Used for the play buffer, block scratch space, decoded tracks and export
/// output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Create a buffer from interleaved samples [L, R, L, R, ...]
    ///
    /// A trailing unpaired sample is dropped.
    pub fn from_interleaved(interleaved: &[Sample]) -> Self {
        let paired = &interleaved[..interleaved.len() - interleaved.len() % 2];
        Self {
            samples: bytemuck::cast_slice(paired).to_vec(),
        }
    }

    /// Create a buffer from separate left and right channel slices
    pub fn from_channels(left: &[Sample], right: &[Sample]) -> Self {
        assert_eq!(left.len(), right.len(), "Channel lengths must match");
        let samples = left
            .iter()
            .zip(right.iter())
            .map(|(&l, &r)| StereoSample::new(l, r))
            .collect();
        Self { samples }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    /// Number of stereo samples in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Resize and silence the whole buffer, reusing the allocation when possible
    pub fn reset(&mut self, new_len: usize) {
        self.samples.clear();
        self.samples.resize(new_len, StereoSample::silence());
    }

    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Split into separate left and right channel vectors
    pub fn to_channels(&self) -> (Vec<Sample>, Vec<Sample>) {
        self.samples.iter().map(|s| (s.left, s.right)).unzip()
    }

    /// Add `other * gain` into this buffer starting at `offset`
    ///
    /// Samples that would land past the end of this buffer are dropped.
    pub fn add_scaled_from(&mut self, offset: usize, other: &[StereoSample], gain: Sample) {
        if offset >= self.samples.len() {
            return;
        }
        for (dst, src) in self.samples[offset..].iter_mut().zip(other.iter()) {
            *dst += *src * gain;
        }
    }

    /// Copy `other` into this buffer starting at `offset`, clipped to the end
    pub fn copy_from_slice_at(&mut self, offset: usize, other: &[StereoSample]) {
        if offset >= self.samples.len() {
            return;
        }
        let n = other.len().min(self.samples.len() - offset);
        self.samples[offset..offset + n].copy_from_slice(&other[..n]);
    }

    /// Scale all samples by a factor
    pub fn scale(&mut self, factor: Sample) {
        for sample in &mut self.samples {
            *sample *= factor;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

/// Convert a duration in seconds to a sample count at `rate`
#[inline]
pub fn seconds_to_samples(seconds: f64, rate: u32) -> usize {
    if seconds <= 0.0 {
        0
    } else {
        (seconds * rate as f64) as usize
    }
}
