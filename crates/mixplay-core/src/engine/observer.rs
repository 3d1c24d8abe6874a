//! Engine notifications
//!
//! Observers are called from engine worker threads, never from the audio
//! callback. State notifications are only delivered when the state changes.

use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;

use crate::model::{PlayerState, RecorderState};

/// Receiver of engine notifications
///
/// Every method has a no-op default so implementors pick what they need.
pub trait EngineObserver: Send + Sync {
    /// Playback position as a fraction of the duration, 0..=1
    fn on_progress(&self, _progress: f32) {}

    fn on_state_changed(&self, _state: PlayerState) {}

    fn on_error(&self, _message: &str) {}

    fn on_recorder_state_changed(&self, _state: RecorderState) {}

    /// Seconds recorded so far
    fn on_recorder_progress(&self, _seconds: f32) {}

    /// Input peak since the last report, in dB
    fn on_recorder_level(&self, _db: f32) {}

    fn on_recorder_error(&self, _message: &str) {}

    /// Device list as JSON, sent when it changed
    fn on_device_list_updated(&self, _json: &str) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}

/// Owned form of a notification, for channel-based observers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress(f32),
    State(PlayerState),
    Error(String),
    RecorderState(RecorderState),
    RecorderProgress(f32),
    RecorderLevel(f32),
    RecorderError(String),
    DeviceList(String),
}

impl EngineObserver for Sender<EngineEvent> {
    fn on_progress(&self, progress: f32) {
        let _ = self.send(EngineEvent::Progress(progress));
    }

    fn on_state_changed(&self, state: PlayerState) {
        let _ = self.send(EngineEvent::State(state));
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(EngineEvent::Error(message.to_string()));
    }

    fn on_recorder_state_changed(&self, state: RecorderState) {
        let _ = self.send(EngineEvent::RecorderState(state));
    }

    fn on_recorder_progress(&self, seconds: f32) {
        let _ = self.send(EngineEvent::RecorderProgress(seconds));
    }

    fn on_recorder_level(&self, db: f32) {
        let _ = self.send(EngineEvent::RecorderLevel(db));
    }

    fn on_recorder_error(&self, message: &str) {
        let _ = self.send(EngineEvent::RecorderError(message.to_string()));
    }

    fn on_device_list_updated(&self, json: &str) {
        let _ = self.send(EngineEvent::DeviceList(json.to_string()));
    }
}

#[derive(Debug)]
struct LastSent {
    player: PlayerState,
    recorder: RecorderState,
    device_list: Option<String>,
}

/// Deduplicating front for an observer
pub(crate) struct Notifier {
    observer: Arc<dyn EngineObserver>,
    last: Mutex<LastSent>,
}

impl Notifier {
    pub fn new(observer: Arc<dyn EngineObserver>) -> Self {
        Self {
            observer,
            last: Mutex::new(LastSent {
                player: PlayerState::Idle,
                recorder: RecorderState::Idle,
                device_list: None,
            }),
        }
    }

    fn last(&self) -> std::sync::MutexGuard<'_, LastSent> {
        match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn current_state(&self) -> PlayerState {
        self.last().player
    }

    pub fn current_recorder_state(&self) -> RecorderState {
        self.last().recorder
    }

    pub fn progress(&self, progress: f32) {
        self.observer.on_progress(progress.clamp(0.0, 1.0));
    }

    pub fn state(&self, state: PlayerState) {
        {
            let mut last = self.last();
            if last.player == state {
                return;
            }
            last.player = state;
        }
        log::debug!("player state: {}", state);
        self.observer.on_state_changed(state);
    }

    pub fn error(&self, message: &str) {
        log::warn!("{}", message);
        self.observer.on_error(message);
    }

    pub fn recorder_state(&self, state: RecorderState) {
        {
            let mut last = self.last();
            if last.recorder == state {
                return;
            }
            last.recorder = state;
        }
        log::debug!("recorder state: {}", state);
        self.observer.on_recorder_state_changed(state);
    }

    pub fn recorder_progress(&self, seconds: f32) {
        self.observer.on_recorder_progress(seconds);
    }

    pub fn recorder_level(&self, db: f32) {
        self.observer.on_recorder_level(db);
    }

    pub fn recorder_error(&self, message: &str) {
        log::warn!("recorder: {}", message);
        self.observer.on_recorder_error(message);
    }

    /// Send the device list if it differs from the last one sent
    pub fn device_list(&self, json: &str) {
        {
            let mut last = self.last();
            if last.device_list.as_deref() == Some(json) {
                return;
            }
            last.device_list = Some(json.to_string());
        }
        self.observer.on_device_list_updated(json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn notifier() -> (Notifier, channel::Receiver<EngineEvent>) {
        let (tx, rx) = channel::unbounded();
        (Notifier::new(Arc::new(tx)), rx)
    }

    #[test]
    fn test_state_changes_are_deduplicated() {
        let (notifier, rx) = notifier();
        notifier.state(PlayerState::Idle);
        notifier.state(PlayerState::Ready);
        notifier.state(PlayerState::Ready);
        notifier.state(PlayerState::Playing);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![EngineEvent::State(PlayerState::Ready), EngineEvent::State(PlayerState::Playing)]
        );
        assert_eq!(notifier.current_state(), PlayerState::Playing);
    }

    #[test]
    fn test_progress_is_clamped_and_not_deduplicated() {
        let (notifier, rx) = notifier();
        notifier.progress(0.5);
        notifier.progress(0.5);
        notifier.progress(1.5);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![EngineEvent::Progress(0.5), EngineEvent::Progress(0.5), EngineEvent::Progress(1.0)]
        );
    }

    #[test]
    fn test_device_list_only_on_change() {
        let (notifier, rx) = notifier();
        notifier.device_list("[]");
        notifier.device_list("[]");
        notifier.device_list("[1]");
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_recorder_state_tracking() {
        let (notifier, rx) = notifier();
        notifier.recorder_state(RecorderState::Ready);
        notifier.recorder_state(RecorderState::Recording);
        notifier.recorder_state(RecorderState::Recording);
        assert_eq!(notifier.current_recorder_state(), RecorderState::Recording);
        assert_eq!(rx.try_iter().count(), 2);
    }
}
