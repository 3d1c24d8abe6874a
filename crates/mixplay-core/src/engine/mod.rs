//! Mix engine
//!
//! The engine mixes a [`MixData`](crate::model::MixData) document block by
//! block into a play buffer, streams it to the audio device and records the
//! microphone alongside.
//!
//! Work is split over a few threads:
//!
//! - the device thread runs [`EngineCallback`]
//! - the `control` queue owns transport state and notifications
//! - the `heavy` queue decodes, mixes blocks and exports
//! - the `record` queue writes recordings
//! - the relay thread turns callback events into queue tasks
//! - the progress timer reports position and input level

mod dispatch;
mod export;
mod loader;
mod observer;
mod player;
mod realtime;
mod recorder;
mod timeline;
mod timer;

use std::sync::{Mutex, MutexGuard};

pub use loader::{BlockLoader, MergeReadyHook, TrackLoadHook};
pub use observer::{EngineEvent, EngineObserver, NoopObserver};
pub use player::MixEngine;
pub use realtime::EngineCallback;
pub use recorder::{FlushRequest, RecordBuffers, RecordingSession};
pub use timeline::{block_region, tile_repeats, ReadRegion, Timing};

/// Lock a mutex, recovering the data if a panicking task poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
