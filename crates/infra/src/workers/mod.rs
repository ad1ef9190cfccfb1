//! Background worker threads.

pub mod dispatch_worker;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::warn;

pub use dispatch_worker::DispatchWorker;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        shutdown: mpsc::Sender<()>,
        join: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        self.signal();
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns `true` when the worker should stop.
pub(crate) fn sleep_or_shutdown(shutdown_rx: &mpsc::Receiver<()>, duration: Duration) -> bool {
    match shutdown_rx.recv_timeout(duration) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

/// Non-blocking shutdown check between iterations.
pub(crate) fn shutdown_requested(shutdown_rx: &mpsc::Receiver<()>) -> bool {
    match shutdown_rx.try_recv() {
        Ok(()) | Err(mpsc::TryRecvError::Disconnected) => true,
        Err(mpsc::TryRecvError::Empty) => false,
    }
}
