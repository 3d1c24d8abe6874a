//! Global mixer settings

use serde::{Deserialize, Serialize};

use crate::error::MixError;
use crate::types::INTERNAL_SAMPLE_RATE;

/// Playback and recording settings, replaced wholesale on update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MixSettings {
    /// Seconds between progress notifications
    pub progress_update_interval: f64,

    /// Target rate for recordings and exports, also requested from the device
    pub sample_rate: u32,

    /// Restart from the beginning when playback completes
    #[serde(rename = "loop")]
    pub looping: bool,

    pub stop_rec_on_playback_complete: bool,

    /// Start playback together with the recorder
    pub rec_bg_playback: bool,

    /// Route microphone input to the outputs while recording
    pub enable_mic_monitoring: bool,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            progress_update_interval: 0.05,
            sample_rate: INTERNAL_SAMPLE_RATE,
            looping: false,
            stop_rec_on_playback_complete: false,
            rec_bg_playback: true,
            enable_mic_monitoring: false,
        }
    }
}

impl MixSettings {
    pub fn parse(json: &str) -> Result<Self, MixError> {
        if json.trim().is_empty() {
            return Err(MixError::EmptyJson);
        }
        serde_json::from_str(json).map_err(|e| MixError::Json(e.to_string()))
    }

    /// Progress interval clamped to something a timer can honor
    pub fn progress_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.progress_update_interval.clamp(0.01, 10.0))
    }
}
