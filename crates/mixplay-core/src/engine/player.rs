//! Mix player
//!
//! [`MixEngine`] is the public face of the engine. Its methods validate
//! input on the caller's thread and hand the actual state changes to the
//! control queue, so transport operations never block on decoding or I/O.
//!
//! ```text
//!   set_mix ──► control: prepare ──► heavy: open readers, size buffer, load block 0
//!                                                    │
//!                               control: READY ◄─────┘ (dropped if a newer mix arrived)
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use super::dispatch::spawn_relay;
use super::lock;
use super::loader::{BlockLoader, LoadOutcome, MergeReadyHook, PreparedMix, TrackLoadHook};
use super::observer::{EngineObserver, Notifier};
use super::realtime::{EngineCallback, RtEvent, Shared, RT_EVENT_CAPACITY};
use super::recorder::RecordingSession;
use super::timeline::Timing;
use super::timer::ProgressTimer;
use crate::audio::{device_list_json, AudioError, AudioHost, LatencyInfo, StreamInfo, StreamRequest};
use crate::codec::{AudioEncoder, FileEncoder, MemoryReader, OutputSpec, SymphoniaDecoder, TrackDecoder, TrackReader};
use crate::config::EngineConfig;
use crate::dsp::{gain_to_db, resample_channels};
use crate::error::{DecodeError, EngineError, EngineResult};
use crate::model::{MixData, MixSettings, PlayerState, RecorderState};
use crate::queue::{panic_message, TaskQueue};
use crate::types::{seconds_to_samples, StereoBuffer};

/// Threads used to force-load blocks during export
const EXPORT_THREADS: usize = 4;

// ════════════════════════════════════════════════════════════════════════════
// Engine internals
// ════════════════════════════════════════════════════════════════════════════

/// State shared by the queues, the relay thread and the timer
pub(crate) struct EngineInner {
    pub timing: Timing,
    pub shared: Arc<Shared>,
    pub loader: BlockLoader,
    pub control: TaskQueue,
    pub heavy: TaskQueue,
    pub record: TaskQueue,
    pub export_pool: rayon::ThreadPool,
    pub mix: Mutex<Arc<PreparedMix>>,
    pub settings: Mutex<MixSettings>,
    pub decoder: Arc<dyn TrackDecoder>,
    pub encoder: Arc<dyn AudioEncoder>,
    pub notifier: Notifier,
    /// Open recording, owned by the record queue
    pub session: Mutex<Option<RecordingSession>>,
    pub recorder_prepared: AtomicBool,
    pub events: Sender<RtEvent>,
    pub timer: ProgressTimer,
    /// Playback completed without looping; the next play starts over
    pub rewind_on_play: AtomicBool,
    /// Transport change made while a reset held `ready` down
    pub held_state: Mutex<Option<PlayerState>>,
}

impl EngineInner {
    pub fn current_mix(&self) -> Arc<PreparedMix> {
        lock(&self.mix).clone()
    }

    pub fn settings(&self) -> MixSettings {
        lock(&self.settings).clone()
    }

    fn play_buffer_len(&self) -> usize {
        self.shared.lock_rt().play_buffer.len()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Transport (control queue)
    // ────────────────────────────────────────────────────────────────────────

    pub fn play_internal(self: &Arc<Self>) {
        let flags = &self.shared.flags;
        let head = {
            let mut rt = self.shared.lock_rt();
            if self.rewind_on_play.swap(false, Ordering::AcqRel) {
                rt.play_head = 0.0;
            }
            rt.play_head
        };
        flags.completion_pending.store(false, Ordering::Release);
        flags.playing.store(true, Ordering::Release);

        if flags.ready.load(Ordering::Acquire) {
            // Blocks behind the head may have been dropped by a reset
            self.load_block_safe(self.timing.block_at(head), false, |_| {});
            self.notifier.state(PlayerState::Playing);
        } else {
            *lock(&self.held_state) = Some(PlayerState::Playing);
        }
    }

    pub fn pause_internal(&self, stop: bool) {
        let flags = &self.shared.flags;
        flags.playing.store(false, Ordering::Release);
        if stop {
            self.shared.lock_rt().play_head = 0.0;
            self.rewind_on_play.store(false, Ordering::Release);
        }
        let state = if stop { PlayerState::Stopped } else { PlayerState::Paused };
        if flags.ready.load(Ordering::Acquire) {
            self.notifier.state(state);
        } else {
            *lock(&self.held_state) = Some(state);
        }
    }

    pub fn seek_internal(self: &Arc<Self>, position: f64) {
        let flags = &self.shared.flags;
        flags.seeking.store(true, Ordering::Release);
        self.rewind_on_play.store(false, Ordering::Release);
        let head = {
            let mut rt = self.shared.lock_rt();
            rt.play_head = rt.play_buffer.len() as f64 * position;
            rt.play_head
        };
        log::debug!("seek to {:.3} (sample {:.0})", position, head);
        self.load_block_safe(self.timing.block_at(head), false, |inner| {
            inner.shared.flags.seeking.store(false, Ordering::Release);
        });
    }

    /// End of the play buffer reached in the callback
    pub fn on_playback_ended(self: &Arc<Self>) {
        let flags = &self.shared.flags;
        if !flags.completion_pending.load(Ordering::Acquire) {
            // A new mix replaced the one that ended
            return;
        }

        if self.play_buffer_len() == 0 {
            self.notifier.state(PlayerState::Idle);
            flags.completion_pending.store(false, Ordering::Release);
            return;
        }

        self.notifier.progress(1.0);
        self.notifier.state(PlayerState::Completed);

        let settings = self.settings();
        let recording = flags.recording.load(Ordering::Acquire);
        if recording && settings.stop_rec_on_playback_complete {
            // Stops playback and rewinds as well
            self.stop_recorder_internal();
        } else if !recording && settings.looping {
            self.shared.lock_rt().play_head = 0.0;
            self.play_internal();
        } else {
            self.pause_internal(false);
            self.rewind_on_play.store(true, Ordering::Release);
        }
        flags.completion_pending.store(false, Ordering::Release);
    }

    pub fn on_timer(&self) {
        let flags = &self.shared.flags;
        let (head, len, elapsed) = {
            let rt = self.shared.lock_rt();
            (rt.play_head, rt.play_buffer.len(), rt.recorder.elapsed())
        };

        if len > 0
            && flags.playing.load(Ordering::Acquire)
            && flags.ready.load(Ordering::Acquire)
            && !flags.seeking.load(Ordering::Acquire)
            && !flags.completion_pending.load(Ordering::Acquire)
        {
            self.notifier.progress((head / len as f64) as f32);
        }

        if flags.recording.load(Ordering::Acquire) {
            let device_rate = flags.device_rate.load(Ordering::Acquire);
            if device_rate > 0 {
                self.notifier
                    .recorder_progress((elapsed as f64 / device_rate as f64) as f32);
            }
            self.notifier.recorder_level(gain_to_db(flags.take_input_peak()));
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Block loading
    // ────────────────────────────────────────────────────────────────────────

    /// Load `block` on the heavy queue, then run `completion` on the control
    /// queue unless the generation moved on in between
    ///
    /// With `reset`, a new generation starts now: every loaded block is
    /// forgotten and the play buffer is cleared before loading.
    pub fn load_block_safe<F>(self: &Arc<Self>, block: usize, reset: bool, completion: F)
    where
        F: FnOnce(&Arc<EngineInner>) + Send + 'static,
    {
        let generation = if reset {
            self.loader.begin_generation(&self.shared, false)
        } else {
            self.shared.generation()
        };

        let inner = self.clone();
        self.heavy.dispatch(move || {
            if reset {
                let mut rt = inner.shared.lock_rt();
                if inner.shared.generation() == generation {
                    rt.play_buffer.fill_silence();
                }
            }

            let mix = inner.current_mix();
            let outcome = inner
                .loader
                .load_block(block, generation, &mix, &inner.shared, &|message: &str| {
                    inner.notifier.error(message)
                });
            if outcome == LoadOutcome::Stale {
                return;
            }

            let continuation = inner.clone();
            inner.control.dispatch(move || {
                if continuation.shared.generation() == generation {
                    completion(&continuation);
                }
            });
        });
    }

    /// Re-mix the block under the play head from scratch
    pub fn reset_play_buffer_blocks(self: &Arc<Self>) {
        let flags = &self.shared.flags;
        if !flags.ready.swap(false, Ordering::AcqRel) {
            return;
        }
        let head = self.shared.lock_rt().play_head;
        self.load_block_safe(self.timing.block_at(head), true, |inner| {
            let flags = &inner.shared.flags;
            flags.seeking.store(false, Ordering::Release);
            flags.ready.store(true, Ordering::Release);
            if let Some(state) = lock(&inner.held_state).take() {
                inner.notifier.state(state);
            }
        });
    }

    // ────────────────────────────────────────────────────────────────────────
    // Preparation
    // ────────────────────────────────────────────────────────────────────────

    /// Apply a validated mix (control queue)
    pub fn apply_mix(self: &Arc<Self>, data: MixData) {
        let current = self.current_mix();
        if current.data == data {
            if current.opened {
                log::debug!("mix unchanged, re-mixing around the play head");
                self.reset_play_buffer_blocks();
            }
            return;
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.prepare(data))) {
            self.notifier
                .error(&format!("failed to prepare mix: {}", panic_message(&*panic)));
            self.prepare(MixData::default());
        }
    }

    fn prepare(self: &Arc<Self>, data: MixData) {
        let flags = &self.shared.flags;
        flags.ready.store(false, Ordering::Release);
        flags.seeking.store(false, Ordering::Release);
        flags.completion_pending.store(false, Ordering::Release);
        self.rewind_on_play.store(false, Ordering::Release);

        let previous = self.current_mix();
        let generation = self.loader.begin_generation(&self.shared, true);
        self.shared.lock_rt().play_head = 0.0;
        *lock(&self.mix) = Arc::new(PreparedMix::pending(data.clone()));
        log::info!(
            "Preparing mix: {} tracks (generation {})",
            data.tracks.len(),
            generation
        );

        let inner = self.clone();
        self.heavy.dispatch(move || {
            let result = catch_unwind(AssertUnwindSafe(|| inner.open_mix(data, &previous, generation)));
            if let Err(panic) = result {
                inner
                    .notifier
                    .error(&format!("failed to open mix: {}", panic_message(&*panic)));
                inner.finish_prepare(generation, 0);
            }
        });
    }

    /// Open readers, size the play buffer and load the first block (heavy queue)
    fn open_mix(self: &Arc<Self>, data: MixData, previous: &PreparedMix, generation: u64) {
        let rate = self.timing.sample_rate;
        let mut readers: HashMap<String, Arc<dyn TrackReader>> = HashMap::new();

        for track in data.tracks.iter().filter(|t| t.enabled) {
            if self.shared.generation() != generation {
                return;
            }
            if readers.contains_key(&track.id) {
                continue;
            }

            let carried = previous
                .data
                .tracks
                .iter()
                .find(|t| t.id == track.id && t.path == track.path)
                .and_then(|t| previous.reader(t));
            if let Some(reader) = carried {
                readers.insert(track.id.clone(), reader.clone());
                continue;
            }

            match self
                .decoder
                .open(Path::new(&track.path))
                .and_then(|reader| {
                    conform_rate(reader, rate, &track.path, &|message: &str| self.notifier.error(message))
                })
            {
                Ok(reader) => {
                    readers.insert(track.id.clone(), reader);
                }
                Err(e) => self.notifier.error(&e.to_string()),
            }
        }

        let mix = PreparedMix {
            data,
            readers,
            opened: true,
        };
        let duration = mix.total_duration(rate);
        let len = seconds_to_samples(duration, rate);

        {
            let mut rt = self.shared.lock_rt();
            if self.shared.generation() != generation {
                return;
            }
            rt.play_buffer.reset(len);
            rt.play_head = 0.0;
        }
        let mix = {
            let mut slot = lock(&self.mix);
            if self.shared.generation() != generation {
                return;
            }
            let mix = Arc::new(mix);
            *slot = mix.clone();
            mix
        };
        log::info!(
            "Mix opened: {} readers, {:.2}s ({} samples)",
            mix.readers.len(),
            duration,
            len
        );

        let outcome = self
            .loader
            .load_block(0, generation, &mix, &self.shared, &|message: &str| {
                self.notifier.error(message)
            });
        if outcome == LoadOutcome::Stale {
            return;
        }
        self.finish_prepare(generation, len);
    }

    fn finish_prepare(self: &Arc<Self>, generation: u64, len: usize) {
        let inner = self.clone();
        self.control.dispatch(move || {
            if inner.shared.generation() != generation {
                return;
            }
            let flags = &inner.shared.flags;
            // Ready plus the playing flag below cover anything held back
            lock(&inner.held_state).take();
            if len == 0 {
                inner.notifier.state(PlayerState::Error);
                return;
            }
            flags.ready.store(true, Ordering::Release);
            inner.notifier.state(PlayerState::Ready);
            if flags.playing.load(Ordering::Acquire) {
                inner.notifier.state(PlayerState::Playing);
            }
        });
    }

    // ────────────────────────────────────────────────────────────────────────
    // Recorder (control queue)
    // ────────────────────────────────────────────────────────────────────────

    pub fn start_recording(self: &Arc<Self>) {
        let flags = &self.shared.flags;
        {
            let mut rt = self.shared.lock_rt();
            rt.recorder.reset();
            flags.input_peak.store(0, Ordering::Release);
            flags.recording.store(true, Ordering::Release);
        }
        self.notifier.recorder_state(RecorderState::Recording);
        log::info!("Recording started");

        if self.settings().rec_bg_playback {
            self.play_internal();
        }
    }

    /// Stop capturing, queue the captured tail and stop playback
    pub fn stop_recorder_internal(&self) {
        let flags = &self.shared.flags;
        let tail = {
            let mut rt = self.shared.lock_rt();
            if flags.recording.swap(false, Ordering::AcqRel) {
                let mut tail = Vec::new();
                if let Some(request) = rt.recorder.take_deferred() {
                    tail.extend(rt.recorder.samples(request));
                }
                tail.extend(rt.recorder.drain_active());
                Some(tail)
            } else {
                None
            }
        };

        if let Some(tail) = tail {
            self.recorder_prepared.store(false, Ordering::Release);
            log::info!("Recording stopped, {} samples pending", tail.len());
            if self.events.send(RtEvent::FinishRecording(tail)).is_err() {
                log::warn!("relay gone, recording tail dropped");
            }
        }
        self.pause_internal(true);
    }

    /// Recording write failed on the record queue: stop capturing
    pub fn recording_failed(&self, message: &str) {
        {
            let mut rt = self.shared.lock_rt();
            self.shared.flags.recording.store(false, Ordering::Release);
            rt.recorder.reset();
        }
        self.recorder_prepared.store(false, Ordering::Release);
        self.notifier.recorder_state(RecorderState::Error);
        self.notifier.recorder_error(message);
    }
}

/// Convert a reader to `rate` if the decoder produced something else
fn conform_rate(
    reader: Arc<dyn TrackReader>,
    rate: u32,
    path: &str,
    report: &dyn Fn(&str),
) -> Result<Arc<dyn TrackReader>, DecodeError> {
    let native = reader.sample_rate();
    if native == rate || reader.is_empty() {
        return Ok(reader);
    }
    let mut samples = StereoBuffer::silence(reader.len());
    if !reader.read(&mut samples, 0, reader.len(), 0) {
        report(&format!("Read operation was not success for: {}", path));
    }
    let (left, right) = samples.to_channels();
    let resampled =
        resample_channels(&[left, right], native, rate).map_err(|e| DecodeError::Resample(e.to_string()))?;
    let converted = StereoBuffer::from_channels(&resampled[0], &resampled[1]);
    Ok(Arc::new(MemoryReader::new(converted, rate)))
}

// ════════════════════════════════════════════════════════════════════════════
// Public engine
// ════════════════════════════════════════════════════════════════════════════

/// Multi-track mix player and recorder
///
/// Operations return quickly; results arrive through the [`EngineObserver`]
/// passed to [`MixEngine::new`]. Dropping the engine disposes it.
pub struct MixEngine {
    inner: Arc<EngineInner>,
    host: Option<Box<dyn AudioHost>>,
    relay: Option<JoinHandle<()>>,
    grace: Duration,
    disposed: bool,
}

impl MixEngine {
    /// Create an engine using the given decoder and encoder
    pub fn new(
        config: &EngineConfig,
        decoder: Arc<dyn TrackDecoder>,
        encoder: Arc<dyn AudioEncoder>,
        observer: Arc<dyn EngineObserver>,
    ) -> EngineResult<Self> {
        let timing = config.timing();
        let spawn_err = |e: std::io::Error| EngineError::Spawn(e.to_string());

        let export_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(EXPORT_THREADS)
            .thread_name(|i| format!("export-{}", i))
            .build()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let (events_tx, events_rx) = channel::bounded(RT_EVENT_CAPACITY);
        let shared = Arc::new(Shared::default());
        shared
            .flags
            .mic_monitoring
            .store(config.settings.enable_mic_monitoring, Ordering::Release);

        let inner = Arc::new(EngineInner {
            timing,
            shared,
            loader: BlockLoader::new(timing),
            control: TaskQueue::new("control").map_err(spawn_err)?,
            heavy: TaskQueue::new("heavy").map_err(spawn_err)?,
            record: TaskQueue::new("record").map_err(spawn_err)?,
            export_pool,
            mix: Mutex::new(Arc::new(PreparedMix::empty())),
            settings: Mutex::new(config.settings.clone()),
            decoder,
            encoder,
            notifier: Notifier::new(observer),
            session: Mutex::new(None),
            recorder_prepared: AtomicBool::new(false),
            events: events_tx,
            timer: ProgressTimer::new(),
            rewind_on_play: AtomicBool::new(false),
            held_state: Mutex::new(None),
        });

        let relay = spawn_relay(Arc::downgrade(&inner), events_rx).map_err(spawn_err)?;
        let engine = Self {
            inner,
            host: None,
            relay: Some(relay),
            grace: Duration::from_millis(config.dispose_grace_ms),
            disposed: false,
        };
        engine.start_timer(config.settings.progress_interval())?;

        log::info!(
            "Mix engine created ({}Hz internal, {:.1}s blocks)",
            timing.sample_rate,
            timing.block_duration
        );
        Ok(engine)
    }

    /// Create an engine with the Symphonia decoder and the WAV/FLAC encoder
    pub fn with_defaults(config: &EngineConfig, observer: Arc<dyn EngineObserver>) -> EngineResult<Self> {
        let decoder = Arc::new(SymphoniaDecoder::new(config.timing().sample_rate));
        Self::new(config, decoder, Arc::new(FileEncoder), observer)
    }

    fn start_timer(&self, interval: Duration) -> EngineResult<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .timer
            .start(interval, move || {
                if let Some(inner) = weak.upgrade() {
                    let tick = inner.clone();
                    inner.control.dispatch(move || tick.on_timer());
                }
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Error out (and notify) while an export is running
    fn reject_while_exporting(&self, operation: &'static str) -> EngineResult<()> {
        self.ensure_live()?;
        if self.inner.shared.flags.exporting.load(Ordering::Acquire) {
            let error = EngineError::Exporting(operation);
            self.inner.notifier.error(&error.to_string());
            return Err(error);
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Device
    // ────────────────────────────────────────────────────────────────────────

    /// A callback for driving the engine from an audio device
    ///
    /// [`MixEngine::attach_device`] does this for hosts; call it directly
    /// to drive the engine from your own audio thread.
    pub fn callback(&self) -> EngineCallback {
        EngineCallback::new(self.inner.shared.clone(), self.inner.events.clone(), self.inner.timing)
    }

    /// Attach an audio host and start its output stream
    pub fn attach_device(&mut self, host: Box<dyn AudioHost>) -> EngineResult<StreamInfo> {
        self.ensure_live()?;
        if let Some(mut previous) = self.host.take() {
            previous.close();
        }
        self.host = Some(host);
        let info = self.open_device(false)?;
        self.refresh_devices();
        Ok(info)
    }

    /// Stop the device stream and give the host back
    pub fn detach_device(&mut self) -> Option<Box<dyn AudioHost>> {
        let mut host = self.host.take()?;
        host.close();
        Some(host)
    }

    fn open_device(&mut self, input: bool) -> EngineResult<StreamInfo> {
        let callback = Box::new(self.callback());
        let request = StreamRequest {
            input,
            sample_rate: Some(self.inner.settings().sample_rate),
        };
        let host = self.host.as_mut().ok_or(EngineError::Audio(AudioError::NotAttached))?;
        match host.open(callback, request) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.inner.notifier.error(&format!("Audio device error: {}", e));
                Err(e.into())
            }
        }
    }

    /// Devices of the attached host as JSON
    pub fn device_list(&self) -> String {
        let devices = self.host.as_ref().map(|h| h.devices()).unwrap_or_default();
        device_list_json(&devices)
    }

    /// Re-enumerate devices, notifying when the list changed
    pub fn refresh_devices(&self) {
        let json = self.device_list();
        self.inner.notifier.device_list(&json);
    }

    /// Sample rate, buffer size and latencies of the open stream as JSON
    pub fn device_latency_info(&self) -> String {
        let info = self
            .host
            .as_ref()
            .and_then(|h| h.stream_info())
            .map(|info| LatencyInfo::from_stream(&info))
            .unwrap_or_default();
        serde_json::to_string_pretty(&info).unwrap_or_else(|_| "{}".to_string())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Transport
    // ────────────────────────────────────────────────────────────────────────

    pub fn play(&self) -> EngineResult<()> {
        self.reject_while_exporting("Playing")?;
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.play_internal());
        Ok(())
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.ensure_live()?;
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.pause_internal(false));
        Ok(())
    }

    /// Pause and rewind to the start
    pub fn stop(&self) -> EngineResult<()> {
        self.ensure_live()?;
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.pause_internal(true));
        Ok(())
    }

    pub fn toggle(&self) -> EngineResult<()> {
        if self.is_playing() {
            self.pause()
        } else {
            self.play()
        }
    }

    /// Jump to `position`, a fraction of the duration clamped to 0..=1
    pub fn seek(&self, position: f64) -> EngineResult<()> {
        self.reject_while_exporting("Seeking")?;
        let position = if position.is_nan() { 0.0 } else { position.clamp(0.0, 1.0) };
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.seek_internal(position));
        Ok(())
    }

    /// Replace the mix with a JSON document
    ///
    /// A document that fails validation is reported and leaves the current
    /// mix untouched.
    pub fn set_mix(&self, json: &str) -> EngineResult<()> {
        self.reject_while_exporting("setJson")?;
        let data = MixData::parse(json).map_err(|e| {
            self.inner.notifier.error(&e.to_string());
            e
        })?;
        self.set_mix_data(data)
    }

    /// Replace the mix with an already validated document
    pub fn set_mix_data(&self, data: MixData) -> EngineResult<()> {
        self.reject_while_exporting("setJson")?;
        if let Err(e) = data.validate() {
            self.inner.notifier.error(&e.to_string());
            return Err(e.into());
        }
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.apply_mix(data));
        Ok(())
    }

    /// Replace the settings with a JSON document
    pub fn set_settings(&mut self, json: &str) -> EngineResult<()> {
        self.reject_while_exporting("setSettings")?;
        let settings = MixSettings::parse(json).map_err(|e| {
            self.inner.notifier.error(&e.to_string());
            e
        })?;
        self.apply_settings(settings)
    }

    /// Replace the settings
    ///
    /// Restarts the progress timer when the interval changed and reopens the
    /// device when the sample rate changed.
    pub fn apply_settings(&mut self, settings: MixSettings) -> EngineResult<()> {
        self.reject_while_exporting("setSettings")?;
        let previous = std::mem::replace(&mut *lock(&self.inner.settings), settings.clone());
        self.inner
            .shared
            .flags
            .mic_monitoring
            .store(settings.enable_mic_monitoring, Ordering::Release);

        if self.inner.timer.interval() != Some(settings.progress_interval()) {
            self.start_timer(settings.progress_interval())?;
        }

        if previous.sample_rate != settings.sample_rate {
            let open = self.host.as_ref().and_then(|h| h.stream_info());
            if let Some(info) = open {
                if self.inner.shared.flags.recording.load(Ordering::Acquire) {
                    log::warn!("Not switching device rate while recording");
                } else if info.sample_rate != settings.sample_rate {
                    log::info!("Reopening device at {}Hz", settings.sample_rate);
                    self.open_device(info.has_input())?;
                }
            }
        }
        Ok(())
    }

    /// Re-mix the blocks around the play head
    pub fn reset_play_buffer(&self) -> EngineResult<()> {
        self.reject_while_exporting("Resetting the play buffer")?;
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.reset_play_buffer_blocks());
        Ok(())
    }

    /// Call `hook` with each plain track's block after it is read
    pub fn set_track_load_listener(&self, hook: Option<Arc<TrackLoadHook>>) {
        self.inner.loader.set_track_load_hook(hook);
    }

    /// Call `hook` with each mixed block; returning true adds the block a
    /// second time
    pub fn set_merge_ready_listener(&self, hook: Option<Arc<MergeReadyHook>>) {
        self.inner.loader.set_merge_ready_hook(hook);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────────────

    /// Play head position in seconds
    pub fn current_time(&self) -> f64 {
        self.inner.shared.lock_rt().play_head / self.inner.timing.sample_rate as f64
    }

    /// Mix duration in seconds
    pub fn duration(&self) -> f64 {
        self.inner.play_buffer_len() as f64 / self.inner.timing.sample_rate as f64
    }

    pub fn state(&self) -> PlayerState {
        self.inner.notifier.current_state()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.inner.notifier.current_recorder_state()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.shared.flags.playing.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.shared.flags.recording.load(Ordering::Acquire)
    }

    pub fn is_exporting(&self) -> bool {
        self.inner.shared.flags.exporting.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> MixSettings {
        self.inner.settings()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Recorder
    // ────────────────────────────────────────────────────────────────────────

    /// Create the recording file; the device must be open
    pub fn prepare_recorder(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        self.ensure_live()?;
        let inner = &self.inner;
        let path = path.as_ref();
        // Let a pending stop queue its tail first
        inner.control.wait();

        let flags = &inner.shared.flags;
        if flags.recording.load(Ordering::Acquire) {
            inner
                .notifier
                .recorder_error("Failed to prepare recorder, stop recorder first");
            return Err(EngineError::RecorderActive);
        }

        let device_rate = flags.device_rate.load(Ordering::Acquire);
        if device_rate == 0 {
            inner.notifier.recorder_error(&EngineError::NoDevice.to_string());
            inner.notifier.recorder_state(RecorderState::Error);
            return Err(EngineError::NoDevice);
        }

        inner.notifier.recorder_state(RecorderState::Idle);
        let settings = inner.settings();
        let writer = match inner.encoder.create(path, OutputSpec::new(settings.sample_rate, 1)) {
            Ok(writer) => writer,
            Err(e) => {
                inner.notifier.recorder_error(&e.to_string());
                inner.notifier.recorder_state(RecorderState::Error);
                return Err(e.into());
            }
        };

        let session = RecordingSession::new(writer, path, device_rate, settings.sample_rate);
        if inner.events.send(RtEvent::BeginRecording(session)).is_err() {
            return Err(EngineError::Disposed);
        }
        inner.recorder_prepared.store(true, Ordering::Release);
        inner.notifier.recorder_state(RecorderState::Ready);
        log::info!(
            "Recorder prepared: {:?} ({}Hz device, {}Hz file)",
            path,
            device_rate,
            settings.sample_rate
        );
        Ok(())
    }

    /// Start capturing; reopens the device with input if needed
    pub fn start_recorder(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        if !self.inner.recorder_prepared.load(Ordering::Acquire) {
            self.inner
                .notifier
                .recorder_error("Failed to start recording, prepare not called");
            self.inner.notifier.recorder_state(RecorderState::Error);
            return Err(EngineError::RecorderNotPrepared);
        }

        let needs_input = self
            .host
            .as_ref()
            .and_then(|h| h.stream_info())
            .is_some_and(|info| !info.has_input());
        if needs_input {
            if let Err(e) = self.open_device(true) {
                self.inner.notifier.recorder_error(&e.to_string());
                self.inner.notifier.recorder_state(RecorderState::Error);
                return Err(e);
            }
        }

        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.start_recording());
        Ok(())
    }

    /// Stop capturing and playback, then finish the file
    pub fn stop_recorder(&self) -> EngineResult<()> {
        self.ensure_live()?;
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.stop_recorder_internal());
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Export
    // ────────────────────────────────────────────────────────────────────────

    /// Render the whole mix to a file
    ///
    /// `completion` runs on the control queue once the file is written or
    /// the export failed.
    pub fn export_to_file<F>(&self, path: impl AsRef<Path>, completion: F) -> EngineResult<()>
    where
        F: FnOnce(EngineResult<()>) + Send + 'static,
    {
        self.ensure_live()?;
        let inner = &self.inner;
        let flags = &inner.shared.flags;

        if flags.playing.load(Ordering::Acquire)
            || flags.recording.load(Ordering::Acquire)
            || flags.exporting.load(Ordering::Acquire)
        {
            inner.notifier.error(&EngineError::Busy.to_string());
            return Err(EngineError::Busy);
        }
        if !flags.ready.load(Ordering::Acquire) || inner.play_buffer_len() == 0 {
            inner.notifier.error(&EngineError::EmptyMix.to_string());
            return Err(EngineError::EmptyMix);
        }

        let sample_rate = inner.settings().sample_rate;
        let writer = inner
            .encoder
            .create(path.as_ref(), OutputSpec::new(sample_rate, 2))
            .map_err(|e| {
                inner.notifier.error(&e.to_string());
                EngineError::from(e)
            })?;

        flags.exporting.store(true, Ordering::Release);
        log::info!("Exporting to {:?} at {}Hz", path.as_ref(), sample_rate);

        let task = self.inner.clone();
        self.inner.heavy.dispatch(move || {
            let result = task.render_export(writer, sample_rate);
            task.shared.flags.exporting.store(false, Ordering::Release);
            if let Err(e) = &result {
                task.notifier.error(&e.to_string());
            }
            task.control.dispatch(move || completion(result));
        });
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Disposal
    // ────────────────────────────────────────────────────────────────────────

    /// Stop everything and join every engine thread
    ///
    /// Idempotent; called by `Drop`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        log::info!("Disposing mix engine");

        self.inner.timer.stop();
        let inner = self.inner.clone();
        self.inner.control.dispatch(move || inner.stop_recorder_internal());
        self.inner.control.wait();

        if let Some(mut host) = self.host.take() {
            host.close();
        }
        std::thread::sleep(self.grace);

        let _ = self.inner.events.send(RtEvent::Shutdown);
        if let Some(relay) = self.relay.take() {
            if relay.join().is_err() {
                log::error!("relay thread panicked");
            }
        }

        self.inner.heavy.stop();
        self.inner.control.stop();
        self.inner.record.stop();
        log::info!("Mix engine disposed");
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioWriter;
    use crate::engine::EngineEvent;
    use crate::error::EncodeError;
    use crate::model::MixTrack;
    use crate::types::StereoSample;
    use crate::audio::AudioCallback;
    use crossbeam::channel::Receiver;
    use std::path::PathBuf;
    use std::time::Instant;

    /// 100 samples per second, 1 second blocks
    const RATE: u32 = 100;

    /// Decoder serving constant-valued tracks from memory
    #[derive(Default)]
    struct FakeDecoder {
        tracks: HashMap<String, Arc<dyn TrackReader>>,
    }

    impl FakeDecoder {
        fn with(mut self, path: &str, value: f32, seconds: f64) -> Self {
            let len = (seconds * RATE as f64) as usize;
            let samples = StereoBuffer::from_vec(vec![StereoSample::mono(value); len]);
            self.tracks
                .insert(path.to_string(), Arc::new(MemoryReader::new(samples, RATE)));
            self
        }
    }

    impl TrackDecoder for FakeDecoder {
        fn open(&self, path: &Path) -> Result<Arc<dyn TrackReader>, DecodeError> {
            self.tracks
                .get(path.to_string_lossy().as_ref())
                .cloned()
                .ok_or_else(|| DecodeError::Open {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
        }
    }

    /// Reader at half the engine rate whose reads always fail
    struct FailingReader;

    impl TrackReader for FailingReader {
        fn sample_rate(&self) -> u32 {
            RATE / 2
        }

        fn len(&self) -> usize {
            50
        }

        fn read(&self, _dest: &mut StereoBuffer, _dest_offset: usize, _count: usize, _src_offset: usize) -> bool {
            false
        }
    }

    /// Files written through the fake encoder, by path
    type Written = Arc<Mutex<HashMap<PathBuf, (OutputSpec, Vec<Vec<f32>>, bool)>>>;

    #[derive(Default)]
    struct FakeEncoder {
        written: Written,
    }

    struct FakeWriter {
        path: PathBuf,
        written: Written,
    }

    impl AudioEncoder for FakeEncoder {
        fn create(&self, path: &Path, spec: OutputSpec) -> Result<Box<dyn AudioWriter>, EncodeError> {
            if path.extension().is_some_and(|e| e == "mp3") {
                return Err(EncodeError::UnsupportedExtension(path.to_path_buf()));
            }
            let channels = vec![Vec::new(); spec.channels as usize];
            lock(&self.written).insert(path.to_path_buf(), (spec, channels, false));
            Ok(Box::new(FakeWriter {
                path: path.to_path_buf(),
                written: self.written.clone(),
            }))
        }
    }

    impl AudioWriter for FakeWriter {
        fn write(&mut self, channels: &[&[f32]]) -> Result<(), EncodeError> {
            if self.path.starts_with("full") {
                return Err(EncodeError::Write("disk full".to_string()));
            }
            let mut written = lock(&self.written);
            let Some((_, data, _)) = written.get_mut(&self.path) else {
                return Err(EncodeError::Write("file gone".to_string()));
            };
            for (dest, src) in data.iter_mut().zip(channels) {
                dest.extend_from_slice(src);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }

        fn finalize(self: Box<Self>) -> Result<(), EncodeError> {
            if let Some(entry) = lock(&self.written).get_mut(&self.path) {
                entry.2 = true;
            }
            Ok(())
        }
    }

    struct Harness {
        engine: MixEngine,
        events: Receiver<EngineEvent>,
        written: Written,
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            internal_sample_rate: RATE,
            block_duration: 1.0,
            record_buffer_duration: 1.0,
            dispose_grace_ms: 0,
            ..Default::default()
        };
        config.settings.sample_rate = RATE;
        config.settings.progress_update_interval = 10.0;
        config
    }

    fn harness(decoder: FakeDecoder) -> Harness {
        harness_with(config(), decoder)
    }

    fn harness_with(config: EngineConfig, decoder: FakeDecoder) -> Harness {
        let (tx, rx) = channel::unbounded();
        let encoder = FakeEncoder::default();
        let written = encoder.written.clone();
        let engine = MixEngine::new(&config, Arc::new(decoder), Arc::new(encoder), Arc::new(tx)).unwrap();
        Harness {
            engine,
            events: rx,
            written,
        }
    }

    fn mix_json(tracks: Vec<MixTrack>) -> String {
        MixData::new(tracks).to_json()
    }

    /// Wait until the control and heavy queues ran everything they were given
    fn settle(engine: &MixEngine) {
        for _ in 0..3 {
            engine.inner.control.wait();
            engine.inner.heavy.wait();
            engine.inner.record.wait();
        }
        engine.inner.control.wait();
    }

    fn wait_for(events: &Receiver<EngineEvent>, expected: EngineEvent) -> Vec<EngineEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if event == expected => return seen,
                Ok(event) => seen.push(event),
                Err(_) => break,
            }
        }
        panic!("{:?} not received, saw {:?}", expected, seen);
    }

    /// Run silent-input periods of 10 frames
    fn run_callback(callback: &mut EngineCallback, periods: usize) {
        let mut output = vec![0.0; 20];
        for _ in 0..periods {
            callback.process(&[], &mut output, 2);
        }
    }

    #[test]
    fn test_prepare_reaches_ready() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0).with("b.wav", 0.25, 1.0));
        let tracks = vec![
            MixTrack::new("a", "a.wav"),
            MixTrack::new("b", "b.wav").with_offset(1.5),
        ];
        h.engine.set_mix(&mix_json(tracks)).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));

        assert_eq!(h.engine.state(), PlayerState::Ready);
        assert!((h.engine.duration() - 2.5).abs() < 1e-9);
        assert_eq!(h.engine.current_time(), 0.0);
        assert!(h.engine.inner.loader.is_loaded(0));
    }

    #[test]
    fn test_missing_file_reports_and_contributes_silence() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 1.0));
        let tracks = vec![MixTrack::new("a", "a.wav"), MixTrack::new("x", "missing.wav")];
        h.engine.set_mix(&mix_json(tracks)).unwrap();
        let seen = wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        assert!(seen
            .iter()
            .any(|e| matches!(e, EngineEvent::Error(m) if m.contains("missing.wav"))));
        assert!((h.engine.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_read_during_rate_conversion_is_reported() {
        let mut decoder = FakeDecoder::default();
        decoder.tracks.insert("slow.wav".to_string(), Arc::new(FailingReader));
        let h = harness(decoder);

        h.engine.set_mix(&mix_json(vec![MixTrack::new("s", "slow.wav")])).unwrap();
        wait_for(
            &h.events,
            EngineEvent::Error("Read operation was not success for: slow.wav".to_string()),
        );
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        assert_eq!(h.engine.duration(), 1.0);
    }

    #[test]
    fn test_empty_mix_is_error() {
        let h = harness(FakeDecoder::default());
        h.engine
            .set_mix(&mix_json(vec![MixTrack::new("x", "missing.wav")]))
            .unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Error));
        assert_eq!(h.engine.duration(), 0.0);
    }

    #[test]
    fn test_duplicate_id_leaves_mix_untouched() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));

        let duplicate = mix_json(vec![MixTrack::new("a", "a.wav"), MixTrack::new("a", "a.wav")]);
        let err = h.engine.set_mix(&duplicate).unwrap_err();
        assert!(matches!(err, EngineError::Mix(crate::error::MixError::DuplicateId(_))));
        settle(&h.engine);

        assert_eq!(h.engine.state(), PlayerState::Ready);
        assert!((h.engine.duration() - 2.0).abs() < 1e-9);
        assert_eq!(h.engine.inner.current_mix().data.tracks.len(), 1);
    }

    #[test]
    fn test_identical_mix_keeps_readers() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0));
        let json = mix_json(vec![MixTrack::new("a", "a.wav")]);
        h.engine.set_mix(&json).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        let before = h.engine.inner.current_mix();

        h.engine.set_mix(&json).unwrap();
        settle(&h.engine);
        let after = h.engine.inner.current_mix();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(h.engine.inner.shared.flags.ready.load(Ordering::Acquire));
        assert!(h.engine.inner.loader.is_loaded(0));
    }

    #[test]
    fn test_changed_volume_carries_reader_by_id() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        let before = h.engine.inner.current_mix().readers["a"].clone();

        let louder = mix_json(vec![MixTrack::new("a", "a.wav").with_volume(2.0)]);
        h.engine.set_mix(&louder).unwrap();
        settle(&h.engine);
        let after = h.engine.inner.current_mix();
        assert!(Arc::ptr_eq(&before, &after.readers["a"]));
        assert_eq!(after.data.tracks[0].volume, 2.0);
        assert_eq!(h.engine.inner.shared.lock_rt().play_buffer.as_slice()[0].left, 1.0);
    }

    #[test]
    fn test_playback_completes_then_pauses() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 1.0));
        let mut callback = h.engine.callback();
        callback.about_to_start(RATE, 10);

        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        h.engine.play().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));

        // 10 periods of 10 frames cover the buffer, the 11th ends it
        run_callback(&mut callback, 11);
        let seen = wait_for(&h.events, EngineEvent::State(PlayerState::Completed));
        assert!(seen.contains(&EngineEvent::Progress(1.0)));
        wait_for(&h.events, EngineEvent::State(PlayerState::Paused));
        assert!(!h.engine.is_playing());

        // Playing again starts over
        h.engine.play().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));
        assert_eq!(h.engine.current_time(), 0.0);
    }

    #[test]
    fn test_looping_restarts_from_zero() {
        let mut config = config();
        config.settings.looping = true;
        let h = harness_with(config, FakeDecoder::default().with("a.wav", 0.5, 1.0));
        let mut callback = h.engine.callback();
        callback.about_to_start(RATE, 10);

        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        h.engine.play().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));

        run_callback(&mut callback, 11);
        wait_for(&h.events, EngineEvent::State(PlayerState::Completed));
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));
        settle(&h.engine);
        assert!(h.engine.is_playing());
        assert_eq!(h.engine.current_time(), 0.0);

        run_callback(&mut callback, 1);
        assert!((h.engine.current_time() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_seek_clamps_and_clears_seeking() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 4.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));

        h.engine.seek(0.5).unwrap();
        settle(&h.engine);
        assert!((h.engine.current_time() - 2.0).abs() < 1e-9);
        assert!(h.engine.inner.loader.is_loaded(2));
        assert!(!h.engine.inner.shared.flags.seeking.load(Ordering::Acquire));

        h.engine.seek(7.0).unwrap();
        settle(&h.engine);
        assert!((h.engine.current_time() - 4.0).abs() < 1e-9);

        h.engine.seek(-1.0).unwrap();
        settle(&h.engine);
        assert_eq!(h.engine.current_time(), 0.0);
        assert!(!h.engine.inner.shared.flags.seeking.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_rewinds() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 4.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        h.engine.seek(0.5).unwrap();
        h.engine.play().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));

        h.engine.toggle().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Paused));
        assert!((h.engine.current_time() - 2.0).abs() < 1e-9);

        h.engine.stop().unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Stopped));
        assert_eq!(h.engine.current_time(), 0.0);
    }

    #[test]
    fn test_export_writes_whole_mix() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0).with("b.wav", 0.25, 1.0));
        let tracks = vec![
            MixTrack::new("a", "a.wav"),
            MixTrack::new("b", "b.wav").with_offset(1.5),
        ];
        h.engine.set_mix(&mix_json(tracks)).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));

        // Hold the heavy queue so the export cannot finish early
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        h.engine.inner.heavy.dispatch(move || {
            let _ = gate_rx.recv();
        });

        let (done_tx, done_rx) = channel::bounded(1);
        h.engine
            .export_to_file("out.wav", move |result| {
                let _ = done_tx.send(result.is_ok());
            })
            .unwrap();
        assert!(h.engine.is_exporting());
        assert!(matches!(h.engine.play(), Err(EngineError::Exporting(_))));
        assert!(matches!(h.engine.seek(0.5), Err(EngineError::Exporting(_))));
        assert!(matches!(h.engine.set_mix("{}"), Err(EngineError::Exporting(_))));
        gate_tx.send(()).unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!h.engine.is_exporting());

        let written = lock(&h.written);
        let (spec, channels, finalized) = &written[Path::new("out.wav")];
        assert_eq!(*spec, OutputSpec::new(RATE, 2));
        assert!(*finalized);
        assert_eq!(channels[0].len(), 250);
        for (i, &sample) in channels[0].iter().enumerate() {
            let expected = match i {
                0..=149 => 0.5,
                150..=199 => 0.75,
                _ => 0.25,
            };
            assert!((sample - expected).abs() < 1e-6, "sample {}", i);
        }
        assert_eq!(channels[0], channels[1]);
    }

    #[test]
    fn test_export_rejected_when_busy_or_empty() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 2.0));
        assert!(matches!(h.engine.export_to_file("out.wav", |_| {}), Err(EngineError::EmptyMix)));

        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));
        h.engine.play().unwrap();
        settle(&h.engine);
        assert!(matches!(h.engine.export_to_file("out.wav", |_| {}), Err(EngineError::Busy)));
        assert!(lock(&h.written).is_empty());
    }

    #[test]
    fn test_recorder_requires_device_and_prepare() {
        let mut h = harness(FakeDecoder::default());
        assert!(matches!(h.engine.prepare_recorder("rec.wav"), Err(EngineError::NoDevice)));
        assert!(matches!(h.engine.start_recorder(), Err(EngineError::RecorderNotPrepared)));
        assert_eq!(h.engine.recorder_state(), RecorderState::Error);

        let mut callback = h.engine.callback();
        callback.about_to_start(RATE, 10);
        assert!(matches!(h.engine.prepare_recorder("rec.mp3"), Err(EngineError::Encode(_))));
        h.engine.prepare_recorder("rec.wav").unwrap();
        assert_eq!(h.engine.recorder_state(), RecorderState::Ready);
    }

    #[test]
    fn test_record_flushes_and_finishes() {
        let mut config = config();
        config.settings.rec_bg_playback = false;
        let mut h = harness_with(config, FakeDecoder::default());
        let mut callback = h.engine.callback();
        callback.about_to_start(RATE, 10);

        h.engine.prepare_recorder("rec.wav").unwrap();
        h.engine.start_recorder().unwrap();
        wait_for(&h.events, EngineEvent::RecorderState(RecorderState::Recording));
        assert!(h.engine.is_recording());

        // 1 s record buffers at 100 Hz: 15 periods of 10 frames flush once
        let input = vec![0.25; 10];
        let mut output = vec![0.0; 20];
        for _ in 0..15 {
            callback.process(&input, &mut output, 2);
        }

        h.engine.stop_recorder().unwrap();
        wait_for(&h.events, EngineEvent::RecorderState(RecorderState::Stopped));
        wait_for(&h.events, EngineEvent::RecorderState(RecorderState::Idle));

        let written = lock(&h.written);
        let (spec, channels, finalized) = &written[Path::new("rec.wav")];
        assert_eq!(*spec, OutputSpec::new(RATE, 1));
        assert!(*finalized);
        assert_eq!(channels[0].len(), 150);
        assert!(channels[0].iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_record_write_failure_stops_recording() {
        let mut config = config();
        config.settings.rec_bg_playback = false;
        let mut h = harness_with(config, FakeDecoder::default());
        let mut callback = h.engine.callback();
        callback.about_to_start(RATE, 10);

        h.engine.prepare_recorder("full/rec.wav").unwrap();
        h.engine.start_recorder().unwrap();
        wait_for(&h.events, EngineEvent::RecorderState(RecorderState::Recording));

        let input = vec![0.25; 10];
        let mut output = vec![0.0; 20];
        for _ in 0..15 {
            callback.process(&input, &mut output, 2);
        }

        let seen = wait_for(&h.events, EngineEvent::RecorderState(RecorderState::Error));
        assert!(!seen.contains(&EngineEvent::RecorderState(RecorderState::Stopped)));
        wait_for(
            &h.events,
            EngineEvent::RecorderError("Failed to write file: disk full".to_string()),
        );
        settle(&h.engine);
        assert!(!h.engine.is_recording());
        assert!(!h.engine.is_playing());
        assert_eq!(h.engine.recorder_state(), RecorderState::Error);
        assert!(matches!(h.engine.start_recorder(), Err(EngineError::RecorderNotPrepared)));

        let written = lock(&h.written);
        let (_, channels, finalized) = &written[Path::new("full/rec.wav")];
        assert!(channels[0].is_empty());
        assert!(*finalized);
    }

    #[test]
    fn test_transport_change_during_reset_is_announced() {
        let h = harness(FakeDecoder::default().with("a.wav", 0.5, 3.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Ready));

        let hold_heavy = |engine: &MixEngine| {
            let (gate_tx, gate_rx) = channel::bounded::<()>(0);
            engine.inner.heavy.dispatch(move || {
                let _ = gate_rx.recv();
            });
            gate_tx
        };

        let gate = hold_heavy(&h.engine);
        h.engine.reset_play_buffer().unwrap();
        h.engine.play().unwrap();
        h.engine.inner.control.wait();
        assert!(h.engine.is_playing());
        assert_eq!(h.engine.state(), PlayerState::Ready);
        gate.send(()).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Playing));

        settle(&h.engine);
        let gate = hold_heavy(&h.engine);
        h.engine.reset_play_buffer().unwrap();
        h.engine.pause().unwrap();
        h.engine.inner.control.wait();
        assert!(!h.engine.is_playing());
        gate.send(()).unwrap();
        wait_for(&h.events, EngineEvent::State(PlayerState::Paused));
        settle(&h.engine);
        assert_eq!(h.engine.state(), PlayerState::Paused);
    }

    #[test]
    fn test_mic_monitoring_follows_settings() {
        let mut h = harness(FakeDecoder::default());
        assert!(!h.engine.inner.shared.flags.mic_monitoring.load(Ordering::Acquire));
        h.engine
            .set_settings(r#"{"enableMicMonitoring": true, "sampleRate": 100}"#)
            .unwrap();
        assert!(h.engine.inner.shared.flags.mic_monitoring.load(Ordering::Acquire));
        assert!(h.engine.set_settings("not json").is_err());
        assert!(h.engine.settings().enable_mic_monitoring);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut h = harness(FakeDecoder::default().with("a.wav", 0.5, 1.0));
        h.engine.set_mix(&mix_json(vec![MixTrack::new("a", "a.wav")])).unwrap();
        h.engine.dispose();
        h.engine.dispose();
        assert!(matches!(h.engine.play(), Err(EngineError::Disposed)));
        assert!(h.engine.inner.control.is_stopped());
    }
}
