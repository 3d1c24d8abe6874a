//! Mix document model
//!
//! - [`MixData`] / [`MixTrack`]: the declarative description of a mix
//! - [`MixSettings`]: global playback and recording settings
//! - [`PlayerState`] / [`RecorderState`]: externally observed states

mod mix;
mod settings;
mod state;

pub use mix::{MixData, MixTrack};
pub use settings::MixSettings;
pub use state::{PlayerState, RecorderState};
