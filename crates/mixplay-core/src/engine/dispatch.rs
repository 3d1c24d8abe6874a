//! Callback event relay
//!
//! The audio callback may only `try_send` into a bounded channel. The relay
//! thread drains that channel and turns each event into a task on the right
//! queue. Recording events reach the record queue in channel order, so a
//! session is installed before its first flush and finished after its last.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;

use super::lock;
use super::player::EngineInner;
use super::realtime::RtEvent;
use super::recorder::RecordingSession;
use crate::model::RecorderState;

/// Spawn the relay thread; it exits on [`RtEvent::Shutdown`] or when the
/// engine is gone
pub(crate) fn spawn_relay(engine: Weak<EngineInner>, events: Receiver<RtEvent>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("rt-relay".into()).spawn(move || {
        while let Ok(event) = events.recv() {
            if matches!(event, RtEvent::Shutdown) {
                break;
            }
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.relay(event);
        }
        log::debug!("relay thread stopped");
    })
}

impl EngineInner {
    fn relay(self: &Arc<Self>, event: RtEvent) {
        match event {
            RtEvent::LoadBlock(block) => {
                let len = self.shared.lock_rt().play_buffer.len();
                if block < self.timing.block_count(len) && !self.loader.is_settled(block) {
                    log::debug!("look-ahead load of block {}", block);
                    self.load_block_safe(block, false, |_| {});
                }
            }
            RtEvent::FlushRecord(request) => {
                let samples = self.shared.lock_rt().recorder.samples(request);
                let inner = self.clone();
                self.record.dispatch(move || inner.write_recording(samples));
            }
            RtEvent::PlaybackEnded => {
                let inner = self.clone();
                self.control.dispatch(move || inner.on_playback_ended());
            }
            RtEvent::BeginRecording(session) => {
                let inner = self.clone();
                self.record.dispatch(move || inner.install_session(session));
            }
            RtEvent::FinishRecording(tail) => {
                let inner = self.clone();
                self.record.dispatch(move || inner.finish_recording(tail));
            }
            RtEvent::Shutdown => {}
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Record queue
    // ────────────────────────────────────────────────────────────────────────

    fn install_session(&self, session: RecordingSession) {
        let replaced = lock(&self.session).replace(session);
        if let Some(old) = replaced {
            log::warn!("Replacing unstarted recording {:?}", old.path());
            if let Err(e) = old.finish() {
                log::warn!("Could not close {}", e);
            }
        }
    }

    fn write_recording(self: &Arc<Self>, samples: Vec<f32>) {
        let result = match lock(&self.session).as_mut() {
            Some(session) => session.write(samples),
            // Failed earlier; the samples have nowhere to go
            None => return,
        };

        if let Err(e) = result {
            let failed = lock(&self.session).take();
            if let Some(session) = failed {
                log::error!("Recording to {:?} failed: {}", session.path(), e);
                if let Err(e) = session.finish() {
                    log::warn!("Could not close {}", e);
                }
            }
            let inner = self.clone();
            let message = e.to_string();
            self.control.dispatch(move || {
                inner.recording_failed(&message);
                inner.pause_internal(true);
            });
        }
    }

    fn finish_recording(&self, tail: Vec<f32>) {
        let Some(mut session) = lock(&self.session).take() else {
            return;
        };
        let path = session.path().to_path_buf();

        match session.write(tail).and_then(|_| session.finish()) {
            Ok(()) => {
                log::info!("Recording saved to {:?}", path);
                self.notifier.recorder_state(RecorderState::Stopped);
                self.notifier.recorder_state(RecorderState::Idle);
            }
            Err(e) => {
                self.notifier.recorder_state(RecorderState::Error);
                self.notifier.recorder_error(&e.to_string());
            }
        }
    }
}
