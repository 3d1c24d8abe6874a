//! Mixplay Core - block-based multi-track mixing, playback and recording
//!
//! A mix is a JSON document of tracks placed on a timeline. The engine
//! decodes the tracks, mixes the timeline block by block into a play
//! buffer, plays it through an audio device, records the microphone
//! alongside, and can export the whole mix to a file.

pub mod audio;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod types;

pub use engine::{EngineEvent, EngineObserver, MixEngine, NoopObserver};
pub use error::{EngineError, EngineResult};
pub use model::{MixData, MixSettings, MixTrack, PlayerState, RecorderState};
pub use types::*;
