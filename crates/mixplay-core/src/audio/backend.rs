//! Audio backend traits
//!
//! The engine drives a device through [`AudioHost`] and is driven by it
//! through [`AudioCallback`]. [`CpalHost`](super::CpalHost) is the production
//! host; tests call the callback directly.

use serde::Serialize;

use super::device::AudioDevice;
use super::error::AudioResult;

/// Receiver of device audio
///
/// Runs on the device's real-time thread: implementations must not block,
/// allocate or do I/O inside `process`.
pub trait AudioCallback: Send + 'static {
    /// Called once before the first `process` of a stream
    fn about_to_start(&mut self, sample_rate: u32, buffer_size: usize);

    /// Fill `output` (interleaved, `channels` per frame) for one device period
    ///
    /// `input` holds mono microphone samples for the same period, or is
    /// empty when no input stream is open.
    fn process(&mut self, input: &[f32], output: &mut [f32], channels: usize);

    /// Called after the stream stopped
    fn stopped(&mut self) {}

    /// Device reported an error
    fn error(&mut self, _message: &str) {}
}

/// What the engine asks for when opening a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRequest {
    /// Open the microphone as well
    pub input: bool,
    /// Preferred device rate
    pub sample_rate: Option<u32>,
}

/// What the device actually opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub sample_rate: u32,
    /// Frames per callback
    pub buffer_size: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    /// Extra frames between the callback and the speaker, when known
    pub output_latency: Option<u32>,
    /// Extra frames between the microphone and the callback, when known
    pub input_latency: Option<u32>,
}

impl StreamInfo {
    pub fn has_input(&self) -> bool {
        self.input_channels > 0
    }
}

/// Latency report for the open stream, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyInfo {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub buffer_latency: f64,
    pub output_latency: f64,
    pub input_latency: f64,
}

impl LatencyInfo {
    pub fn from_stream(info: &StreamInfo) -> Self {
        if info.sample_rate == 0 {
            return Self::default();
        }
        let ms = |frames: u32| frames as f64 * 1000.0 / info.sample_rate as f64;
        Self {
            sample_rate: info.sample_rate,
            buffer_size: info.buffer_size,
            buffer_latency: ms(info.buffer_size),
            output_latency: info.output_latency.map(ms).unwrap_or(-1.0),
            input_latency: info.input_latency.map(ms).unwrap_or(-1.0),
        }
    }
}

/// A platform audio device manager
///
/// Only one stream is open at a time; opening again replaces it.
pub trait AudioHost {
    /// Open a stream delivering audio to `callback`
    fn open(&mut self, callback: Box<dyn AudioCallback>, request: StreamRequest) -> AudioResult<StreamInfo>;

    /// Stop and drop the current stream
    fn close(&mut self);

    /// Parameters of the open stream
    fn stream_info(&self) -> Option<StreamInfo>;

    /// Input and output devices visible to this host
    fn devices(&self) -> Vec<AudioDevice>;
}
