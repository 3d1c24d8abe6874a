//! CPAL audio host
//!
//! Opens one output stream and, when recording, one input stream. Input
//! reaches the output callback through a lock-free ring buffer so the
//! engine sees microphone and speaker audio in the same `process` call.
//!
//! ```text
//! ┌──────────────────┐   push()   ┌─────────────────────┐   pop()   ┌──────────────────────┐
//! │   Input Stream   │───────────►│  Mic Sample Queue   │──────────►│    Output Stream     │
//! │ (channel 0 only) │            │  (lock-free SPSC)   │           │ (owns AudioCallback) │
//! └──────────────────┘            └─────────────────────┘           └──────────────────────┘
//! ```

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::backend::{AudioCallback, AudioHost, StreamInfo, StreamRequest};
use super::config::{AudioConfig, MAX_BUFFER_SIZE};
use super::device::{enumerate_devices, find_input_device, find_output_device, AudioDevice};
use super::error::{AudioError, AudioResult};
use crate::types::INTERNAL_SAMPLE_RATE;

/// Ring buffer capacity in device periods
const INPUT_QUEUE_PERIODS: usize = 8;

/// State owned by the output stream callback
struct CallbackState {
    callback: Box<dyn AudioCallback>,
    /// Microphone samples from the input stream
    input: Option<rtrb::Consumer<f32>>,
    /// Pre-allocated mono input for one period
    input_scratch: Vec<f32>,
}

impl CallbackState {
    fn new(callback: Box<dyn AudioCallback>, input: Option<rtrb::Consumer<f32>>) -> Self {
        Self {
            callback,
            input,
            input_scratch: vec![0.0; MAX_BUFFER_SIZE],
        }
    }

    /// Process one output period (RT-safe: no allocation)
    fn process(&mut self, data: &mut [f32], channels: usize) {
        let frames = (data.len() / channels).min(self.input_scratch.len());
        let input_len = match self.input.as_mut() {
            Some(consumer) => {
                for slot in self.input_scratch[..frames].iter_mut() {
                    // Missing input (device drift or startup) becomes silence
                    *slot = consumer.pop().unwrap_or(0.0);
                }
                frames
            }
            None => 0,
        };
        self.callback.process(&self.input_scratch[..input_len], data, channels);
    }
}

/// Audio host backed by CPAL
///
/// Keeps the streams alive while open. Dropping the host stops audio.
pub struct CpalHost {
    config: AudioConfig,
    output_stream: Option<Stream>,
    input_stream: Option<Stream>,
    state: Option<Arc<Mutex<CallbackState>>>,
    info: Option<StreamInfo>,
}

impl CpalHost {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            output_stream: None,
            input_stream: None,
            state: None,
            info: None,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Open the microphone at `sample_rate`, returning the stream, the
    /// consumer side of its queue and the channel count
    fn open_input(&self, sample_rate: u32, buffer_size: u32) -> AudioResult<(Stream, rtrb::Consumer<f32>, u16)> {
        let device = find_input_device(self.config.input_device.as_ref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .supported_input_configs()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .find(|c| sample_rate >= c.min_sample_rate().0 && sample_rate <= c.max_sample_rate().0)
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!("{} has no f32 input at {}Hz", device_name, sample_rate))
            })?;

        let channels = supported.channels();
        let stream_config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: CpalBufferSize::Fixed(buffer_size),
        };

        let capacity = buffer_size as usize * INPUT_QUEUE_PERIODS;
        let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);
        let step = channels.max(1) as usize;

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(step) {
                        // Queue full: output side is behind, drop
                        if producer.push(frame[0]).is_err() {
                            break;
                        }
                    }
                },
                move |err| {
                    log::error!("Input audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        log::info!("Input device: {} ({} channels @ {}Hz)", device_name, channels, sample_rate);
        Ok((stream, consumer, channels))
    }
}

impl AudioHost for CpalHost {
    fn open(&mut self, callback: Box<dyn AudioCallback>, request: StreamRequest) -> AudioResult<StreamInfo> {
        self.close();

        let device = find_output_device(self.config.output_device.as_ref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using audio device: {}", device_name);

        let target_rate = target_rate(request.sample_rate, self.config.sample_rate);
        let buffer_size = self.config.buffer_size.frames();
        let supported = get_output_config(&device, target_rate)?;
        let sample_rate = supported.sample_rate().0;

        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: CpalBufferSize::Fixed(buffer_size),
        };

        let (input_stream, consumer, input_channels) = if request.input {
            let (stream, consumer, channels) = self.open_input(sample_rate, buffer_size)?;
            (Some(stream), Some(consumer), channels)
        } else {
            (None, None, 0)
        };

        let info = StreamInfo {
            sample_rate,
            buffer_size,
            input_channels,
            output_channels: stream_config.channels,
            output_latency: None,
            // One period waits in the mic queue
            input_latency: input_stream.as_ref().map(|_| buffer_size),
        };

        log::info!(
            "Audio config: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
            stream_config.channels,
            sample_rate,
            buffer_size,
            self.config.buffer_size.latency_ms(sample_rate)
        );

        let state = Arc::new(Mutex::new(CallbackState::new(callback, consumer)));
        if let Ok(mut guard) = state.lock() {
            guard.callback.about_to_start(sample_rate, buffer_size as usize);
        }

        let output_stream = build_output_stream(&device, &stream_config, state.clone())?;
        if let Some(stream) = input_stream.as_ref() {
            stream.play().map_err(|e| AudioError::StreamPlayError(format!("Input: {}", e)))?;
        }
        output_stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        log::info!("Audio stream started{}", if request.input { " (with input)" } else { "" });

        self.output_stream = Some(output_stream);
        self.input_stream = input_stream;
        self.state = Some(state);
        self.info = Some(info);
        Ok(info)
    }

    fn close(&mut self) {
        let had_stream = self.output_stream.is_some();
        self.output_stream = None;
        self.input_stream = None;
        self.info = None;
        if let Some(state) = self.state.take() {
            if let Ok(mut guard) = state.lock() {
                guard.callback.stopped();
            }
        }
        if had_stream {
            log::info!("Audio stream closed");
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.info
    }

    fn devices(&self) -> Vec<AudioDevice> {
        enumerate_devices(
            self.config.output_device.as_ref(),
            self.config.input_device.as_ref(),
            self.info.map(|i| i.sample_rate),
        )
    }
}

impl Drop for CpalHost {
    fn drop(&mut self) {
        self.close();
    }
}

/// Rate to ask the device for
///
/// The mixer settings win over the configured rate, which only applies when
/// the caller has no preference.
fn target_rate(requested: Option<u32>, configured: Option<u32>) -> u32 {
    match (requested, configured) {
        (Some(rate), Some(pinned)) if rate != pinned => {
            log::warn!("Ignoring configured {}Hz output rate, settings ask for {}Hz", pinned, rate);
            rate
        }
        (Some(rate), _) | (None, Some(rate)) => rate,
        (None, None) => INTERNAL_SAMPLE_RATE,
    }
}

/// Get the best output configuration for a device
///
/// Prefers f32 stereo at `target_rate`; falls back to the device's maximum
/// rate when the target is unsupported.
fn get_output_config(device: &cpal::Device, target_rate: u32) -> AudioResult<cpal::SupportedStreamConfig> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    if supported_configs.is_empty() {
        return Err(AudioError::ConfigError(
            "No supported output configurations".to_string(),
        ));
    }

    let in_range = |c: &&cpal::SupportedStreamConfigRange| {
        target_rate >= c.min_sample_rate().0 && target_rate <= c.max_sample_rate().0
    };

    let best_config = supported_configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| {
            supported_configs
                .iter()
                .filter(|c| c.sample_format() == SampleFormat::F32)
                .find(|c| c.channels() >= 2)
        })
        .or_else(|| {
            supported_configs
                .iter()
                .find(|c| c.sample_format() == SampleFormat::F32)
        })
        .ok_or_else(|| AudioError::UnsupportedFormat("device has no f32 output".to_string()))?;

    let sample_rate = if in_range(&best_config) {
        cpal::SampleRate(target_rate)
    } else {
        let fallback = best_config.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz",
            target_rate,
            fallback.0
        );
        fallback
    };

    Ok(best_config.clone().with_sample_rate(sample_rate))
}

/// Build the output stream driving the callback
fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    state: Arc<Mutex<CallbackState>>,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    let error_state = state.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| match state.lock() {
                Ok(mut state) => state.process(data, channels),
                Err(_) => data.fill(0.0),
            },
            move |err| {
                log::error!("Output audio stream error: {}", err);
                if let Ok(mut state) = error_state.try_lock() {
                    state.callback.error(&err.to_string());
                }
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}
