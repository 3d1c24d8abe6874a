//! Engine configuration
//!
//! Timing constants, default mixer settings and audio device preferences,
//! persisted as YAML.

mod io;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::engine::Timing;
use crate::model::MixSettings;
use crate::types::{BLOCK_DURATION, INTERNAL_SAMPLE_RATE, RECORD_BUFFER_DURATION, RECORD_BUFFER_MARGIN};

pub use io::{load_config, save_config};

/// Default grace period between detaching the device and stopping queues
pub const DEFAULT_DISPOSE_GRACE_MS: u64 = 100;

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate of the mixed timeline
    pub internal_sample_rate: u32,

    /// Seconds of timeline mixed per block load
    pub block_duration: f64,

    /// Seconds captured per record buffer before a flush
    pub record_buffer_duration: f64,

    /// Capacity headroom for record buffers
    pub record_buffer_margin: f64,

    /// Milliseconds to wait for in-flight audio callbacks on dispose
    pub dispose_grace_ms: u64,

    /// Settings applied before the first `set_settings` call
    pub settings: MixSettings,

    pub audio: AudioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            internal_sample_rate: INTERNAL_SAMPLE_RATE,
            block_duration: BLOCK_DURATION,
            record_buffer_duration: RECORD_BUFFER_DURATION,
            record_buffer_margin: RECORD_BUFFER_MARGIN,
            dispose_grace_ms: DEFAULT_DISPOSE_GRACE_MS,
            settings: MixSettings::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Timing parameters with invalid values replaced by defaults
    pub fn timing(&self) -> Timing {
        let positive = |value: f64, fallback: f64| if value > 0.0 { value } else { fallback };
        Timing {
            sample_rate: if self.internal_sample_rate > 0 {
                self.internal_sample_rate
            } else {
                INTERNAL_SAMPLE_RATE
            },
            block_duration: positive(self.block_duration, BLOCK_DURATION),
            record_buffer_duration: positive(self.record_buffer_duration, RECORD_BUFFER_DURATION),
            record_buffer_margin: self.record_buffer_margin.max(1.0),
        }
    }
}

/// Default location of the engine config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mixplay")
        .join("engine.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_falls_back_on_invalid_values() {
        let config = EngineConfig {
            internal_sample_rate: 0,
            block_duration: -1.0,
            record_buffer_margin: 0.5,
            ..Default::default()
        };
        let timing = config.timing();
        assert_eq!(timing.sample_rate, INTERNAL_SAMPLE_RATE);
        assert_eq!(timing.block_duration, BLOCK_DURATION);
        assert_eq!(timing.record_buffer_margin, 1.0);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");

        let mut config = EngineConfig::default();
        config.block_duration = 2.5;
        config.settings.looping = true;
        config.audio.sample_rate = Some(44100);

        save_config(&config, &path).unwrap();
        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "block_duration: 10.0\n").unwrap();

        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded.block_duration, 10.0);
        assert_eq!(loaded.internal_sample_rate, INTERNAL_SAMPLE_RATE);
    }
}
