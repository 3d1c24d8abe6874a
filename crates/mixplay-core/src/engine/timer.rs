//! Progress timer
//!
//! A background thread ticking at the progress interval. Each tick calls
//! the installed handler, which only enqueues work on the control queue.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

/// Restartable periodic ticker
pub(crate) struct ProgressTimer {
    running: Mutex<Option<Running>>,
}

impl ProgressTimer {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    /// Start ticking every `interval`, replacing a running timer
    pub fn start<F>(&self, interval: Duration, on_tick: F) -> std::io::Result<()>
    where
        F: Fn() + Send + 'static,
    {
        self.stop();

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);
        let handle = thread::Builder::new()
            .name("progress-timer".into())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => on_tick(),
                }
            })?;

        log::debug!("progress timer started ({:?})", interval);
        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running {
                stop_tx,
                handle,
                interval,
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.interval))
    }

    pub fn is_running(&self) -> bool {
        self.interval().is_some()
    }

    /// Stop and join the ticking thread
    pub fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(running) = running {
            // Dropping the sender also wakes the thread
            let _ = running.stop_tx.send(());
            if running.handle.join().is_err() {
                log::error!("progress timer thread panicked");
            }
        }
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ticks_until_stopped() {
        let timer = ProgressTimer::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        timer
            .start(Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.is_running());

        thread::sleep(Duration::from_millis(60));
        timer.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "only {} ticks", after_stop);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_restart_replaces_interval() {
        let timer = ProgressTimer::new();
        timer.start(Duration::from_millis(50), || {}).unwrap();
        timer.start(Duration::from_millis(20), || {}).unwrap();
        assert_eq!(timer.interval(), Some(Duration::from_millis(20)));
        timer.stop();
        timer.stop();
    }
}
