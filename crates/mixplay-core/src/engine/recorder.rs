//! Microphone capture
//!
//! [`RecordBuffers`] is filled by the audio callback. Two mono buffers
//! alternate: when the active one passes the flush threshold it is handed
//! off and capture continues in the other from index 0.
//! [`RecordingSession`] owns the writer and converts flushed audio to the
//! target rate on the record queue.

use std::path::{Path, PathBuf};

use crate::codec::AudioWriter;
use crate::dsp::resample_channels;
use crate::error::EncodeError;
use crate::engine::Timing;

/// A full record buffer waiting to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    pub slot: usize,
    pub count: usize,
}

/// Double-buffered mono capture, preallocated for the device rate
#[derive(Debug, Default)]
pub struct RecordBuffers {
    buffers: [Vec<f32>; 2],
    active: usize,
    head: usize,
    threshold: usize,
    elapsed: u64,
    device_rate: u32,
    /// Flush that could not be handed off yet
    pending: Option<FlushRequest>,
}

impl RecordBuffers {
    /// Size both buffers for `device_rate`
    ///
    /// Keeps existing contents when the rate is unchanged so queued flushes
    /// still find their samples.
    pub fn allocate(&mut self, timing: &Timing, device_rate: u32) {
        if device_rate == self.device_rate && !self.buffers[0].is_empty() {
            return;
        }
        let threshold = (timing.record_buffer_duration * device_rate as f64) as usize;
        let capacity = (threshold as f64 * timing.record_buffer_margin).ceil() as usize;
        for buffer in self.buffers.iter_mut() {
            buffer.clear();
            buffer.resize(capacity, 0.0);
        }
        self.threshold = threshold;
        self.device_rate = device_rate;
        self.reset();
    }

    /// Start a new capture session
    pub fn reset(&mut self) {
        self.active = 0;
        self.head = 0;
        self.elapsed = 0;
        self.pending = None;
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffers[0].is_empty()
    }

    /// Samples captured since the last reset
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Write position in the active buffer
    pub fn head(&self) -> usize {
        self.head
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Append input; returns a flush request when the active buffer filled up
    ///
    /// Real-time safe: copies into preallocated storage only. Input that
    /// does not fit the remaining capacity is dropped.
    pub fn push(&mut self, input: &[f32]) -> Option<FlushRequest> {
        if !self.is_allocated() {
            return None;
        }
        let buffer = &mut self.buffers[self.active];
        let n = input.len().min(buffer.len() - self.head);
        buffer[self.head..self.head + n].copy_from_slice(&input[..n]);
        self.head += n;
        self.elapsed += n as u64;

        if self.head > self.threshold {
            let request = FlushRequest {
                slot: self.active,
                count: self.head,
            };
            self.active = 1 - self.active;
            self.head = 0;
            Some(request)
        } else {
            None
        }
    }

    /// Park a flush request whose hand-off failed
    pub fn defer(&mut self, request: FlushRequest) {
        self.pending = Some(request);
    }

    pub fn take_deferred(&mut self) -> Option<FlushRequest> {
        self.pending.take()
    }

    /// Copy out the samples of a flush request
    pub fn samples(&self, request: FlushRequest) -> Vec<f32> {
        let buffer = &self.buffers[request.slot % 2];
        buffer[..request.count.min(buffer.len())].to_vec()
    }

    /// Copy out whatever the active buffer holds and rewind it
    pub fn drain_active(&mut self) -> Vec<f32> {
        let samples = self.buffers[self.active][..self.head].to_vec();
        self.head = 0;
        samples
    }
}

/// An open recording: writer plus rate conversion settings
pub struct RecordingSession {
    writer: Box<dyn AudioWriter>,
    path: PathBuf,
    device_rate: u32,
    target_rate: u32,
}

impl RecordingSession {
    pub fn new(writer: Box<dyn AudioWriter>, path: &Path, device_rate: u32, target_rate: u32) -> Self {
        Self {
            writer,
            path: path.to_path_buf(),
            device_rate,
            target_rate,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convert to the target rate if needed, write, and flush
    pub fn write(&mut self, samples: Vec<f32>) -> Result<(), EncodeError> {
        if samples.is_empty() {
            return Ok(());
        }
        let samples = if self.device_rate != self.target_rate {
            resample_channels(&[samples], self.device_rate, self.target_rate)
                .map_err(|e| EncodeError::Write(e.to_string()))?
                .into_iter()
                .next()
                .unwrap_or_default()
        } else {
            samples
        };
        log::debug!(
            "record flush: {} samples @ {}Hz to {:?}",
            samples.len(),
            self.target_rate,
            self.path
        );
        self.writer.write(&[&samples])?;
        self.writer.flush()
    }

    pub fn finish(self) -> Result<(), EncodeError> {
        self.writer.finalize()
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("path", &self.path)
            .field("device_rate", &self.device_rate)
            .field("target_rate", &self.target_rate)
            .finish_non_exhaustive()
    }
}
