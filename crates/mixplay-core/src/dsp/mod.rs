//! Signal processing helpers
//!
//! - [`Interpolator`]: real-time windowed-sinc reader used by the audio callback
//! - [`resample_channels`]: offline rubato conversion for decode, record and export
//! - [`gain_to_db`]: level metering

mod interpolator;
mod resample;

pub use interpolator::Interpolator;
pub use resample::{resample_channels, resampled_len, ResampleError};

/// Decibel value reported for silence
pub const MINUS_INFINITY_DB: f32 = -100.0;

/// Convert a linear gain to decibels, floored at [`MINUS_INFINITY_DB`]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain > 0.0 {
        (20.0 * gain.log10()).max(MINUS_INFINITY_DB)
    } else {
        MINUS_INFINITY_DB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_to_db() {
        assert_eq!(gain_to_db(1.0), 0.0);
        assert!((gain_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert_eq!(gain_to_db(0.0), MINUS_INFINITY_DB);
        assert_eq!(gain_to_db(1e-9), MINUS_INFINITY_DB);
    }
}
