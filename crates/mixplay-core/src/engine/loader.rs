//! Block loading
//!
//! Mixes one block of the timeline from the track readers and writes it into
//! the play buffer. Loads are idempotent per block and generation, and a
//! load that finds the generation advanced abandons without touching the
//! play buffer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::realtime::Shared;
use super::timeline::{block_region, tile_repeats, Timing};
use crate::codec::TrackReader;
use crate::model::{MixData, MixTrack};
use crate::types::{seconds_to_samples, StereoBuffer};

/// Called with each plain track's block after it was read
pub type TrackLoadHook = dyn Fn(&str, &mut StereoBuffer, u32) + Send + Sync;

/// Called with a copy of each mixed block; returning true adds the copy
/// onto the play buffer
pub type MergeReadyHook = dyn Fn(&mut StereoBuffer, u32) -> bool + Send + Sync;

/// A mix with its readers, keyed by track id
pub(crate) struct PreparedMix {
    pub data: MixData,
    pub readers: HashMap<String, Arc<dyn TrackReader>>,
    /// Readers opened and play buffer sized for this mix
    pub opened: bool,
}

impl PreparedMix {
    pub fn empty() -> Self {
        Self::pending(MixData::default())
    }

    /// Mix accepted but not opened yet
    pub fn pending(data: MixData) -> Self {
        Self {
            data,
            readers: HashMap::new(),
            opened: false,
        }
    }

    pub fn reader(&self, track: &MixTrack) -> Option<&Arc<dyn TrackReader>> {
        self.readers.get(&track.id)
    }

    /// Total duration in seconds from the open readers
    pub fn total_duration(&self, sample_rate: u32) -> f64 {
        self.data.total_duration(|track| {
            self.reader(track)
                .map(|reader| reader.len() as f64 / sample_rate as f64)
        })
    }
}

/// Result of a block load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadOutcome {
    Loaded,
    /// Loaded or loading already
    AlreadyPresent,
    /// Block starts past the end of the play buffer
    OutOfRange,
    /// Generation advanced, work abandoned
    Stale,
    /// Play buffer has no samples
    Empty,
}

#[derive(Default)]
struct LoadState {
    generation: u64,
    loading: HashSet<usize>,
    loaded: HashSet<usize>,
    /// Fully decoded sources of repeating tracks, by path
    repeat_cache: HashMap<String, Arc<StereoBuffer>>,
}

/// Clears the loading mark however the load exits
struct LoadingMark<'a> {
    loader: &'a BlockLoader,
    block: usize,
    generation: u64,
}

impl Drop for LoadingMark<'_> {
    fn drop(&mut self) {
        let mut state = self.loader.state();
        if state.generation == self.generation {
            state.loading.remove(&self.block);
        }
    }
}

/// Block mixer and load bookkeeping
pub struct BlockLoader {
    timing: Timing,
    state: Mutex<LoadState>,
    track_load: RwLock<Option<Arc<TrackLoadHook>>>,
    merge_ready: RwLock<Option<Arc<MergeReadyHook>>>,
}

impl BlockLoader {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            state: Mutex::new(LoadState::default()),
            track_load: RwLock::new(None),
            merge_ready: RwLock::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoadState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn set_track_load_hook(&self, hook: Option<Arc<TrackLoadHook>>) {
        if let Ok(mut slot) = self.track_load.write() {
            *slot = hook;
        }
    }

    pub fn set_merge_ready_hook(&self, hook: Option<Arc<MergeReadyHook>>) {
        if let Ok(mut slot) = self.merge_ready.write() {
            *slot = hook;
        }
    }

    /// Start a new generation: in-flight loads become stale and the load
    /// sets are cleared. The repeat cache survives unless `clear_cache`.
    pub(crate) fn begin_generation(&self, shared: &Shared, clear_cache: bool) -> u64 {
        let generation = shared.generation.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        let mut state = self.state();
        state.generation = generation;
        state.loading.clear();
        state.loaded.clear();
        if clear_cache {
            state.repeat_cache.clear();
        }
        generation
    }

    pub fn is_loaded(&self, block: usize) -> bool {
        self.state().loaded.contains(&block)
    }

    /// Loaded or loading in the current generation
    pub fn is_settled(&self, block: usize) -> bool {
        let state = self.state();
        state.loaded.contains(&block) || state.loading.contains(&block)
    }

    pub fn loaded_count(&self) -> usize {
        self.state().loaded.len()
    }

    /// Mix `block` of `mix` into the play buffer
    ///
    /// `report` receives non-fatal errors (missing readers, failed reads).
    pub(crate) fn load_block(
        &self,
        block: usize,
        generation: u64,
        mix: &PreparedMix,
        shared: &Shared,
        report: &dyn Fn(&str),
    ) -> LoadOutcome {
        if shared.generation() != generation || !mix.opened {
            return LoadOutcome::Stale;
        }

        let buffer_len = shared.lock_rt().play_buffer.len();
        if buffer_len == 0 {
            report("output duration is 0");
            return LoadOutcome::Empty;
        }
        let block_len = self.timing.block_samples();
        let start = block * block_len;
        if start >= buffer_len {
            return LoadOutcome::OutOfRange;
        }
        let count = block_len.min(buffer_len - start);

        {
            let mut state = self.state();
            if state.generation != generation {
                return LoadOutcome::Stale;
            }
            if state.loaded.contains(&block) || state.loading.contains(&block) {
                return LoadOutcome::AlreadyPresent;
            }
            state.loading.insert(block);
        }
        let _mark = LoadingMark {
            loader: self,
            block,
            generation,
        };

        let rate = self.timing.sample_rate;
        let track_hook = self.track_load.read().ok().and_then(|h| h.clone());
        let mut mixed = StereoBuffer::silence(count);
        let mut scratch = StereoBuffer::silence(block_len);

        for track in mix.data.tracks.iter().filter(|t| t.enabled) {
            if shared.generation() != generation {
                return LoadOutcome::Stale;
            }
            let Some(reader) = mix.reader(track) else {
                report(&format!("reader not found for {}", track.path));
                continue;
            };
            scratch.fill_silence();

            if track.repeat {
                let Some(source) = self.repeat_source(track, reader, generation, shared) else {
                    return LoadOutcome::Stale;
                };
                tile_repeats(
                    start,
                    scratch.as_mut_slice(),
                    source.as_slice(),
                    seconds_to_samples(track.offset, rate),
                    seconds_to_samples(track.repeat_interval, rate),
                );
            } else {
                let Some(region) = block_region(&self.timing, block, track, reader.len()) else {
                    continue;
                };
                let ok = reader.read(&mut scratch, region.dst_start, region.count, region.src_start);
                if shared.generation() != generation {
                    return LoadOutcome::Stale;
                }
                if !ok {
                    report(&format!("Read operation was not success for: {}", track.path));
                }
                if let Some(hook) = track_hook.as_ref() {
                    hook(&track.id, &mut scratch, rate);
                }
            }

            mixed.add_scaled_from(0, &scratch.as_slice()[..count], track.volume);
        }

        if shared.generation() != generation {
            return LoadOutcome::Stale;
        }
        let merge_hook = self.merge_ready.read().ok().and_then(|h| h.clone());
        if let Some(hook) = merge_hook {
            let mut copy = mixed.clone();
            if hook(&mut copy, rate) {
                mixed.add_scaled_from(0, copy.as_slice(), 1.0);
            }
        }

        {
            let mut rt = shared.lock_rt();
            if shared.generation() != generation || rt.play_buffer.len() < start + count {
                return LoadOutcome::Stale;
            }
            rt.play_buffer.copy_from_slice_at(start, mixed.as_slice());
        }

        let mut state = self.state();
        if state.generation != generation {
            return LoadOutcome::Stale;
        }
        state.loaded.insert(block);
        log::trace!("block {} loaded (generation {})", block, generation);
        LoadOutcome::Loaded
    }

    /// Whole decoded source of a repeating track, cached by path
    fn repeat_source(
        &self,
        track: &MixTrack,
        reader: &Arc<dyn TrackReader>,
        generation: u64,
        shared: &Shared,
    ) -> Option<Arc<StereoBuffer>> {
        if let Some(cached) = self.state().repeat_cache.get(&track.path) {
            return Some(cached.clone());
        }

        let len = reader.len();
        let mut source = StereoBuffer::silence(len);
        if !reader.read(&mut source, 0, len, 0) {
            log::warn!("Could not read repeat source {}", track.path);
        }

        let mut state = self.state();
        if state.generation != generation || shared.generation() != generation {
            return None;
        }
        Some(
            state
                .repeat_cache
                .entry(track.path.clone())
                .or_insert_with(|| Arc::new(source))
                .clone(),
        )
    }
}
