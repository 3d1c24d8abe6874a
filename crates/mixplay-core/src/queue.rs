//! Serial task queues
//!
//! Each [`TaskQueue`] owns one named worker thread that runs submitted tasks
//! strictly in submission order. Independent queues run concurrently. There
//! are no futures: a task signals completion by dispatching a continuation
//! onto another queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum QueueMessage {
    Run(Task),
    Shutdown,
}

/// Single-worker FIFO executor
pub struct TaskQueue {
    name: String,
    sender: Sender<QueueMessage>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TaskQueue {
    /// Spawn the worker thread for a new queue
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("queue-{}", name))
            .spawn(move || run_worker(&thread_name, receiver))?;

        Ok(Self {
            name: name.to_string(),
            sender,
            stopped: AtomicBool::new(false),
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task; returns false (and drops the task) once stopped
    pub fn dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.sender.send(QueueMessage::Run(Box::new(task))).is_ok()
    }

    /// True when called from this queue's worker thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Block until every task enqueued so far has run
    ///
    /// Returns immediately when the queue is stopped or when called from the
    /// worker itself.
    pub fn wait(&self) {
        if self.is_current() {
            return;
        }
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        if self.dispatch(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.recv();
        }
    }

    /// Stop accepting tasks, run the ones already queued, then join the worker
    ///
    /// Called from the worker itself, the join is skipped and the worker
    /// exits after the current task.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(QueueMessage::Shutdown);

        if self.is_current() {
            return;
        }
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("queue '{}': worker thread panicked", self.name);
            }
        }
        log::debug!("queue '{}' stopped", self.name);
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, receiver: Receiver<QueueMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            QueueMessage::Run(task) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    log::error!("queue '{}': task panicked: {}", name, panic_message(&*panic));
                }
            }
            QueueMessage::Shutdown => break,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
