//! Real-time band-limited interpolation
//!
//! Reads a stereo buffer at a fractional position and rate, writing
//! interleaved device frames. The kernel is a Blackman-windowed sinc
//! tabulated once at construction, so `render` never allocates.

use crate::types::StereoSample;

/// Zero crossings of the kernel on each side of the center
const HALF_WIDTH: usize = 8;

/// Table entries per zero crossing
const RESOLUTION: usize = 256;

/// Upper bound on taps per side when the kernel is stretched for downsampling
const MAX_SPAN: usize = HALF_WIDTH * 4;

/// Windowed-sinc interpolator with a precomputed kernel table
#[derive(Debug, Clone)]
pub struct Interpolator {
    table: Vec<f32>,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator {
    pub fn new() -> Self {
        let len = HALF_WIDTH * RESOLUTION + 1;
        let table = (0..len)
            .map(|i| {
                let x = i as f64 / RESOLUTION as f64;
                (sinc(x) * blackman(x / HALF_WIDTH as f64)) as f32
            })
            .collect();
        Self { table }
    }

    /// Kernel value at distance `x` (in source samples, already scaled by cutoff)
    #[inline]
    fn kernel(&self, x: f64) -> f32 {
        let pos = x.abs() * RESOLUTION as f64;
        let index = pos as usize;
        if index + 1 >= self.table.len() {
            return 0.0;
        }
        let frac = (pos - index as f64) as f32;
        self.table[index] + (self.table[index + 1] - self.table[index]) * frac
    }

    /// Interpolate one stereo frame at fractional source position `pos`
    #[inline]
    fn sample_at(&self, source: &[StereoSample], pos: f64, cutoff: f64, span: isize) -> StereoSample {
        let center = pos.floor() as isize;
        let frac = pos - center as f64;
        let mut acc = StereoSample::silence();
        let mut weight_sum = 0.0f32;

        for k in (1 - span)..=span {
            let index = center + k;
            let weight = self.kernel((k as f64 - frac) * cutoff);
            weight_sum += weight;
            if index >= 0 && (index as usize) < source.len() {
                acc += source[index as usize] * weight;
            }
        }

        // Normalize so a constant signal keeps its level at any ratio
        if weight_sum.abs() > f32::EPSILON {
            acc * (1.0 / weight_sum)
        } else {
            acc
        }
    }

    /// Render `output.len() / channels` frames reading `source` from `start`
    /// in steps of `ratio` source samples per output frame
    ///
    /// Channel 0 receives left, channel 1 right, a mono device gets the
    /// average, and channels beyond the second are silenced. Positions
    /// outside `source` read as silence.
    pub fn render(&self, source: &[StereoSample], start: f64, ratio: f64, output: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        let frames = output.len() / channels;
        let exact = (ratio - 1.0).abs() < 1e-9 && start.fract() == 0.0;

        let cutoff = if ratio > 1.0 { 1.0 / ratio } else { 1.0 };
        let span = ((HALF_WIDTH as f64 / cutoff).ceil() as usize).min(MAX_SPAN) as isize;

        for frame in 0..frames {
            let sample = if exact {
                source
                    .get(start as usize + frame)
                    .copied()
                    .unwrap_or_default()
            } else {
                self.sample_at(source, start + frame as f64 * ratio, cutoff, span)
            };

            let out = &mut output[frame * channels..(frame + 1) * channels];
            if channels == 1 {
                out[0] = (sample.left + sample.right) * 0.5;
                continue;
            }
            out[0] = sample.left;
            out[1] = sample.right;
            for ch in out.iter_mut().skip(2) {
                *ch = 0.0;
            }
        }
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Blackman window over [-1, 1] evaluated at |t|
fn blackman(t: f64) -> f64 {
    if t.abs() >= 1.0 {
        return 0.0;
    }
    let phase = std::f64::consts::PI * (t + 1.0);
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}
