//! Mix document: tracks placed on a timeline
//!
//! A mix is parsed from JSON and validated as a whole. Validation either
//! accepts the complete document or rejects it; nothing is half-applied.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::MixError;

fn default_volume() -> f32 {
    1.0
}

fn default_enabled() -> bool {
    true
}

/// A single audio source placed on the mix timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixTrack {
    /// Unique, non-empty identifier
    #[serde(alias = "id_")]
    pub id: String,

    /// Absolute path of the audio file
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_volume")]
    pub volume: f32,

    /// Timeline position of the first sample, in seconds
    #[serde(default)]
    pub offset: f64,

    /// Trim from the start of the source, in seconds
    #[serde(default)]
    pub from_time: f64,

    /// Play length in seconds (0 = natural length of the source)
    #[serde(default)]
    pub duration: f64,

    /// Tile the whole source every `repeat_interval` seconds
    #[serde(default)]
    pub repeat: bool,

    #[serde(default)]
    pub repeat_interval: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl MixTrack {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            volume: default_volume(),
            offset: 0.0,
            from_time: 0.0,
            duration: 0.0,
            repeat: false,
            repeat_interval: 0.0,
            enabled: true,
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_from_time(mut self, from_time: f64) -> Self {
        self.from_time = from_time;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_repeat(mut self, interval: f64) -> Self {
        self.repeat = true;
        self.repeat_interval = interval;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Duration the track occupies given the source length in seconds
    ///
    /// An explicit `duration` wins; otherwise the whole source is used.
    pub fn effective_duration(&self, source_seconds: f64) -> f64 {
        if self.duration == 0.0 {
            source_seconds
        } else {
            self.duration
        }
    }

    fn validate(&self) -> Result<(), MixError> {
        if self.id.is_empty() {
            return Err(MixError::EmptyId);
        }
        let fields = [
            ("duration", self.duration),
            ("fromTime", self.from_time),
            ("offset", self.offset),
            ("repeatInterval", self.repeat_interval),
        ];
        for (field, value) in fields {
            if value < 0.0 {
                return Err(MixError::Negative { id: self.id.clone(), field });
            }
        }
        Ok(())
    }
}

/// Complete mix description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixData {
    #[serde(default)]
    pub tracks: Vec<MixTrack>,

    /// Informational output path
    #[serde(default)]
    pub output: String,

    /// Fixed output duration in seconds (0 = derived from the tracks)
    #[serde(default)]
    pub output_duration: f64,
}

impl MixData {
    pub fn new(tracks: Vec<MixTrack>) -> Self {
        Self {
            tracks,
            ..Default::default()
        }
    }

    /// Parse and validate a mix document
    ///
    /// Side-effect free: no files are touched.
    pub fn parse(json: &str) -> Result<Self, MixError> {
        if json.trim().is_empty() {
            return Err(MixError::EmptyJson);
        }
        let mix: MixData = serde_json::from_str(json).map_err(|e| MixError::Json(e.to_string()))?;
        mix.validate()?;
        Ok(mix)
    }

    /// Check ids are unique and non-empty and time fields are non-negative
    pub fn validate(&self) -> Result<(), MixError> {
        let mut ids = HashSet::with_capacity(self.tracks.len());
        for track in &self.tracks {
            track.validate()?;
            if !ids.insert(track.id.as_str()) {
                return Err(MixError::DuplicateId(track.id.clone()));
            }
        }
        Ok(())
    }

    /// Total output duration in seconds
    ///
    /// `source_seconds` returns the decoded length of a track's source, or
    /// `None` when the track has no open reader. Such tracks are ignored.
    pub fn total_duration<F>(&self, source_seconds: F) -> f64
    where
        F: Fn(&MixTrack) -> Option<f64>,
    {
        if self.output_duration > 0.0 {
            return self.output_duration;
        }
        self.tracks
            .iter()
            .filter(|t| t.enabled)
            .filter_map(|t| {
                let seconds = source_seconds(t)?;
                Some(t.offset + t.effective_duration(seconds) - t.from_time)
            })
            .fold(0.0, f64::max)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let mix = MixData::parse(r#"{"tracks":[{"id_":"a","path":"/tmp/a.wav"}]}"#).unwrap();
        let track = &mix.tracks[0];
        assert_eq!(track.id, "a");
        assert_eq!(track.volume, 1.0);
        assert!(track.enabled);
        assert!(!track.repeat);
        assert_eq!(mix.output_duration, 0.0);
    }

    #[test]
    fn test_parse_camel_case_fields() {
        let json = r#"{
            "tracks": [{"id": "x", "path": "p", "fromTime": 1.5, "repeatInterval": 2, "repeat": true}],
            "outputDuration": 12
        }"#;
        let mix = MixData::parse(json).unwrap();
        assert_eq!(mix.tracks[0].from_time, 1.5);
        assert_eq!(mix.tracks[0].repeat_interval, 2.0);
        assert_eq!(mix.output_duration, 12.0);
    }

    #[test]
    fn test_empty_json_rejected() {
        assert_eq!(MixData::parse("  "), Err(MixError::EmptyJson));
        assert!(matches!(MixData::parse("{not json"), Err(MixError::Json(_))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let json = r#"{"tracks":[{"id":"x","path":"a"},{"id":"x","path":"b"}]}"#;
        assert_eq!(MixData::parse(json), Err(MixError::DuplicateId("x".to_string())));
    }

    #[test]
    fn test_empty_id_rejected() {
        let json = r#"{"tracks":[{"id":"","path":"a"}]}"#;
        assert_eq!(MixData::parse(json), Err(MixError::EmptyId));
    }

    #[test]
    fn test_negative_fields_rejected() {
        for field in ["duration", "fromTime", "offset", "repeatInterval"] {
            let json = format!(r#"{{"tracks":[{{"id":"t","path":"a","{}":-1}}]}}"#, field);
            match MixData::parse(&json) {
                Err(MixError::Negative { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected negative {} error, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_total_duration_from_tracks() {
        let mix = MixData::new(vec![
            MixTrack::new("a", "a"),
            MixTrack::new("b", "b").with_offset(1.5),
            MixTrack::new("c", "c").with_offset(10.0).disabled(),
            MixTrack::new("d", "missing").with_offset(20.0),
        ]);
        let lengths = |t: &MixTrack| match t.path.as_str() {
            "a" => Some(2.0),
            "b" | "c" => Some(1.0),
            _ => None,
        };
        assert_eq!(mix.total_duration(lengths), 2.5);
    }

    #[test]
    fn test_total_duration_explicit_and_trimmed() {
        let mut mix = MixData::new(vec![MixTrack::new("a", "a").with_from_time(1.0).with_offset(2.0)]);
        assert_eq!(mix.total_duration(|_| Some(4.0)), 5.0);

        mix.output_duration = 7.0;
        assert_eq!(mix.total_duration(|_| Some(4.0)), 7.0);

        assert_eq!(MixData::default().total_duration(|_| Some(1.0)), 0.0);
    }

    #[test]
    fn test_structural_equality() {
        let a = MixData::new(vec![MixTrack::new("a", "a")]);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.tracks[0].volume = 0.5;
        assert_ne!(a, b);
    }
}
