//! Real-time audio callback
//!
//! [`EngineCallback`] is driven by the audio device. It reads the play buffer
//! through the interpolator, captures microphone input into the record
//! buffers, and reports work for other threads through a bounded event
//! channel. It never allocates, never does file I/O, and only blocks on the
//! short [`Shared::rt`] lock.
//!
//! ```text
//!   device ──process()──► EngineCallback ──try_send──► RtEvent channel ──► relay thread
//!                              │                                             │
//!                        lock Shared::rt                             heavy / record / control
//!                   (play buffer, heads, record buffers)                   queues
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;

use super::recorder::{FlushRequest, RecordBuffers, RecordingSession};
use super::Timing;
use crate::audio::AudioCallback;
use crate::dsp::Interpolator;
use crate::types::StereoBuffer;

/// Capacity of the callback event channel
pub(crate) const RT_EVENT_CAPACITY: usize = 256;

/// Work requested by the audio callback, or queued behind its requests
#[derive(Debug)]
pub(crate) enum RtEvent {
    /// Look-ahead load of a block
    LoadBlock(usize),
    /// A record buffer filled up
    FlushRecord(FlushRequest),
    /// The play head reached the end of the buffer
    PlaybackEnded,
    /// A prepared recording, queued ahead of its first flush
    BeginRecording(RecordingSession),
    /// Final samples of a recording, sent by the control queue
    FinishRecording(Vec<f32>),
    Shutdown,
}

/// State shared between the callback and the engine, guarded by one lock
#[derive(Debug, Default)]
pub(crate) struct RealtimeState {
    pub play_buffer: StereoBuffer,
    /// Read position in internal-rate samples
    pub play_head: f64,
    pub recorder: RecordBuffers,
}

/// Lock-free transport flags
#[derive(Debug, Default)]
pub(crate) struct TransportFlags {
    /// User intent to play
    pub playing: AtomicBool,
    /// Mix prepared and first block loaded
    pub ready: AtomicBool,
    pub seeking: AtomicBool,
    /// End of buffer reached, completion not yet handled
    pub completion_pending: AtomicBool,
    /// Written only while holding the realtime lock
    pub recording: AtomicBool,
    pub exporting: AtomicBool,
    pub mic_monitoring: AtomicBool,
    pub device_rate: AtomicU32,
    pub buffer_size: AtomicU32,
    /// Peak input level since the last read, as f32 bits
    pub input_peak: AtomicU32,
}

impl TransportFlags {
    /// Callback playback gate
    pub fn playback_enabled(&self) -> bool {
        self.playing.load(Ordering::Acquire)
            && self.ready.load(Ordering::Acquire)
            && !self.seeking.load(Ordering::Acquire)
            && !self.completion_pending.load(Ordering::Acquire)
    }

    /// Read and reset the input peak
    pub fn take_input_peak(&self) -> f32 {
        f32::from_bits(self.input_peak.swap(0, Ordering::AcqRel))
    }
}

/// Everything the callback shares with the engine
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub rt: Mutex<RealtimeState>,
    pub flags: TransportFlags,
    /// Mix generation, bumped whenever loaded blocks become invalid
    pub generation: AtomicU64,
}

impl Shared {
    pub fn lock_rt(&self) -> MutexGuard<'_, RealtimeState> {
        match self.rt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Device-facing callback for one opened stream
pub struct EngineCallback {
    shared: Arc<Shared>,
    events: Sender<RtEvent>,
    interpolator: Interpolator,
    timing: Timing,
    /// Last look-ahead request, with the generation it was made in
    last_request: Option<(usize, u64)>,
}

impl EngineCallback {
    pub(crate) fn new(shared: Arc<Shared>, events: Sender<RtEvent>, timing: Timing) -> Self {
        Self {
            shared,
            events,
            interpolator: Interpolator::new(),
            timing,
            last_request: None,
        }
    }

    fn request_block(&mut self, block: usize) {
        let generation = self.shared.generation();
        if self.last_request == Some((block, generation)) {
            return;
        }
        if self.events.try_send(RtEvent::LoadBlock(block)).is_ok() {
            self.last_request = Some((block, generation));
        }
    }
}

impl AudioCallback for EngineCallback {
    fn about_to_start(&mut self, sample_rate: u32, buffer_size: usize) {
        let flags = &self.shared.flags;
        flags.device_rate.store(sample_rate, Ordering::Release);
        flags.buffer_size.store(buffer_size as u32, Ordering::Release);
        self.shared.lock_rt().recorder.allocate(&self.timing, sample_rate);
        self.last_request = None;
        log::info!("Audio device starting: {}Hz, {} frame buffer", sample_rate, buffer_size);
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], channels: usize) {
        output.fill(0.0);
        // Owned handle so `self` stays free for `request_block`
        let shared = self.shared.clone();
        let flags = &shared.flags;
        let device_rate = flags.device_rate.load(Ordering::Acquire);
        if device_rate == 0 || channels == 0 {
            return;
        }
        let frames = output.len() / channels;
        let playback = flags.playback_enabled();
        let mut next_block = None;

        let mut rt = shared.lock_rt();

        let recording = flags.recording.load(Ordering::Acquire);
        if recording && !input.is_empty() {
            if let Some(request) = rt.recorder.take_deferred() {
                if self.events.try_send(RtEvent::FlushRecord(request)).is_err() {
                    rt.recorder.defer(request);
                }
            }
            if let Some(request) = rt.recorder.push(input) {
                if self.events.try_send(RtEvent::FlushRecord(request)).is_err() {
                    rt.recorder.defer(request);
                }
            }
            let peak = input.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            flags.input_peak.fetch_max(peak.to_bits(), Ordering::AcqRel);
        }

        if playback {
            let ratio = self.timing.sample_rate as f64 / device_rate as f64;
            let read_count = frames as f64 * ratio;
            if rt.play_head + read_count > rt.play_buffer.len() as f64 {
                if self.events.try_send(RtEvent::PlaybackEnded).is_ok() {
                    flags.completion_pending.store(true, Ordering::Release);
                }
            } else {
                self.interpolator
                    .render(rt.play_buffer.as_slice(), rt.play_head, ratio, output, channels);
                rt.play_head += read_count;
                next_block = Some(self.timing.block_at(rt.play_head) + 1);
            }
        }
        drop(rt);

        if let Some(block) = next_block {
            self.request_block(block);
        }

        if recording && flags.mic_monitoring.load(Ordering::Acquire) {
            for (frame, &sample) in output.chunks_mut(channels).zip(input) {
                for out in frame {
                    *out += sample;
                }
            }
        }
    }

    fn stopped(&mut self) {
        self.shared.flags.device_rate.store(0, Ordering::Release);
        log::info!("Audio device stopped");
    }

    fn error(&mut self, message: &str) {
        log::error!("Audio device error: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;
    use crossbeam::channel::{self, Receiver};

    fn setup(buffer: Vec<StereoSample>) -> (EngineCallback, Arc<Shared>, Receiver<RtEvent>) {
        let shared = Arc::new(Shared::default());
        shared.lock_rt().play_buffer = StereoBuffer::from_vec(buffer);
        let (tx, rx) = channel::bounded(RT_EVENT_CAPACITY);
        let mut callback = EngineCallback::new(shared.clone(), tx, Timing::default());
        callback.about_to_start(48000, 4);
        (callback, shared, rx)
    }

    fn start_playing(shared: &Shared) {
        shared.flags.playing.store(true, Ordering::Release);
        shared.flags.ready.store(true, Ordering::Release);
    }

    #[test]
    fn test_silence_until_gate_open() {
        let (mut callback, shared, _rx) = setup(vec![StereoSample::mono(0.5); 64]);
        let mut output = vec![1.0; 8];

        callback.process(&[], &mut output, 2);
        assert!(output.iter().all(|&s| s == 0.0));

        shared.flags.playing.store(true, Ordering::Release);
        callback.process(&[], &mut output, 2);
        assert!(output.iter().all(|&s| s == 0.0), "not ready yet");

        shared.flags.ready.store(true, Ordering::Release);
        shared.flags.seeking.store(true, Ordering::Release);
        callback.process(&[], &mut output, 2);
        assert!(output.iter().all(|&s| s == 0.0), "suppressed while seeking");

        shared.flags.seeking.store(false, Ordering::Release);
        callback.process(&[], &mut output, 2);
        assert!(output.iter().all(|&s| s == 0.5));
        assert_eq!(shared.lock_rt().play_head, 4.0);
    }

    #[test]
    fn test_playback_requests_next_block_once() {
        let (mut callback, shared, rx) = setup(vec![StereoSample::mono(0.1); 64]);
        start_playing(&shared);
        let mut output = vec![0.0; 8];

        callback.process(&[], &mut output, 2);
        callback.process(&[], &mut output, 2);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RtEvent::LoadBlock(1)));

        shared.generation.fetch_add(1, Ordering::AcqRel);
        callback.process(&[], &mut output, 2);
        assert!(matches!(rx.try_recv(), Ok(RtEvent::LoadBlock(1))));
    }

    #[test]
    fn test_end_of_buffer_signals_completion_once() {
        let (mut callback, shared, rx) = setup(vec![StereoSample::mono(0.1); 6]);
        start_playing(&shared);
        let mut output = vec![0.0; 8];

        callback.process(&[], &mut output, 2);
        let _ = rx.try_iter().count();

        // 4 + 4 > 6: nothing rendered, completion reported
        output.fill(1.0);
        callback.process(&[], &mut output, 2);
        assert!(output.iter().all(|&s| s == 0.0));
        assert!(matches!(rx.try_recv(), Ok(RtEvent::PlaybackEnded)));
        assert!(shared.flags.completion_pending.load(Ordering::Acquire));

        callback.process(&[], &mut output, 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.lock_rt().play_head, 4.0);
    }

    #[test]
    fn test_device_rate_ratio_advances_head() {
        let (mut callback, shared, _rx) = setup(vec![StereoSample::mono(0.2); 4096]);
        callback.about_to_start(24000, 4);
        start_playing(&shared);

        let mut output = vec![0.0; 100 * 2];
        callback.process(&[], &mut output, 2);
        assert_eq!(shared.lock_rt().play_head, 200.0);
    }

    #[test]
    fn test_recording_and_monitoring() {
        let (mut callback, shared, rx) = setup(Vec::new());
        {
            let _rt = shared.lock_rt();
            shared.flags.recording.store(true, Ordering::Release);
        }
        shared.flags.mic_monitoring.store(true, Ordering::Release);

        let input = [0.25f32; 4];
        let mut output = vec![0.0; 8];
        callback.process(&input, &mut output, 2);

        assert!(output.iter().all(|&s| s == 0.25));
        assert_eq!(shared.lock_rt().recorder.elapsed(), 4);
        assert_eq!(shared.flags.take_input_peak(), 0.25);
        assert_eq!(shared.flags.take_input_peak(), 0.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_record_buffer_swap_emits_one_flush() {
        let (mut callback, shared, rx) = setup(Vec::new());
        callback.about_to_start(1000, 100);
        shared.flags.recording.store(true, Ordering::Release);

        // 10s threshold at 1kHz = 10000 samples; push 10100
        let input = vec![0.1f32; 100];
        let mut output = vec![0.0; 200];
        for _ in 0..101 {
            callback.process(&input, &mut output, 2);
        }

        let flushes: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                RtEvent::FlushRecord(request) => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(flushes, vec![FlushRequest { slot: 0, count: 10100 }]);

        callback.process(&input, &mut output, 2);
        let rt = shared.lock_rt();
        assert_eq!(rt.recorder.active_slot(), 1);
        assert_eq!(rt.recorder.head(), 100);
    }
}
