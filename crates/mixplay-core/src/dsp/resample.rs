//! Offline sample rate conversion with rubato

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("failed to build resampler: {0}")]
    Construction(String),

    #[error("resampling failed: {0}")]
    Process(String),
}

/// Number of frames produced when converting `frames` from `from` Hz to `to` Hz
pub fn resampled_len(frames: usize, from: u32, to: u32) -> usize {
    if from == 0 {
        return 0;
    }
    (frames as f64 * to as f64 / from as f64).ceil() as usize
}

/// Convert planar audio from `from` Hz to `to` Hz
///
/// Every output channel has exactly [`resampled_len`] frames, aligned with
/// the input (the filter delay is removed).
pub fn resample_channels(channels: &[Vec<f32>], from: u32, to: u32) -> Result<Vec<Vec<f32>>, ResampleError> {
    let frames = channels.first().map(|c| c.len()).unwrap_or(0);
    if from == to || frames == 0 || channels.is_empty() {
        return Ok(channels.to_vec());
    }
    if from == 0 || to == 0 {
        return Err(ResampleError::Construction(format!("invalid rates {} -> {}", from, to)));
    }

    let ratio = to as f64 / from as f64;
    let target = resampled_len(frames, from, to);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, frames, channels.len())
        .map_err(|e| ResampleError::Construction(e.to_string()))?;

    let delay = resampler.output_delay();
    let mut output = resampler
        .process(channels, None)
        .map_err(|e| ResampleError::Process(e.to_string()))?;

    // Drain the filter tail until the delayed output covers the whole input
    let mut guard = 0;
    while output[0].len() < delay + target && guard < 64 {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;
        if tail[0].is_empty() {
            break;
        }
        for (out, extra) in output.iter_mut().zip(tail) {
            out.extend_from_slice(&extra);
        }
        guard += 1;
    }

    for out in output.iter_mut() {
        let start = delay.min(out.len());
        out.drain(..start);
        out.resize(target, 0.0);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampled_len_rounds_up() {
        assert_eq!(resampled_len(441, 44100, 48000), 480);
        assert_eq!(resampled_len(1000, 48000, 44100), 919);
        assert_eq!(resampled_len(10, 0, 48000), 0);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let input = vec![vec![0.1, 0.2, 0.3]];
        assert_eq!(resample_channels(&input, 48000, 48000).unwrap(), input);
    }

    #[test]
    fn test_exact_output_length_and_level() {
        let input = vec![vec![0.5f32; 44100], vec![-0.25f32; 44100]];
        let output = resample_channels(&input, 44100, 48000).unwrap();

        assert_eq!(output.len(), 2);
        assert_eq!(output[0].len(), 48000);
        assert_eq!(output[1].len(), 48000);
        // Away from the edges a constant signal stays constant
        assert!((output[0][24000] - 0.5).abs() < 0.01);
        assert!((output[1][24000] + 0.25).abs() < 0.01);
    }

    #[test]
    fn test_downsample_length() {
        let input = vec![vec![0.0f32; 4800]];
        let output = resample_channels(&input, 48000, 16000).unwrap();
        assert_eq!(output[0].len(), 1600);
    }
}
