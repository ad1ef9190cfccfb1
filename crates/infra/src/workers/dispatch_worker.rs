use std::sync::mpsc;
use std::thread;

use tracing::{debug, error, info};

use crate::service::QueueService;
use crate::store::EntryStore;

use super::{WorkerHandle, shutdown_requested, sleep_or_shutdown};

/// Dispatch worker loop.
///
/// - Polls the queue through [`QueueService::process_ready_entries`]
/// - Sleeps when idle (a quarter of the interval in sticky mode)
/// - Store errors are logged and retried next cycle
/// - Shutdown is checked between cycles; a running batch always completes
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawn the `index`-th dispatch thread of `service`.
    pub fn spawn<S>(service: QueueService<S>, index: usize) -> WorkerHandle
    where
        S: EntryStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("{}-dispatch-{index}", service.queue().config().queue_name);

        let worker_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&worker_name, &service, &shutdown_rx))
            .expect("failed to spawn dispatch worker thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn worker_loop<S>(name: &str, service: &QueueService<S>, shutdown_rx: &mpsc::Receiver<()>)
where
    S: EntryStore + 'static,
{
    let config = service.queue().config();
    let idle = config.idle_sleep();
    let backoff = config.polling_sleep_time;
    info!(worker = %name, idle_ms = idle.as_millis() as u64, "dispatch worker started");

    while !shutdown_requested(shutdown_rx) {
        match service.process_ready_entries() {
            Ok(0) => {
                if sleep_or_shutdown(shutdown_rx, idle) {
                    break;
                }
            }
            Ok(count) => {
                debug!(worker = %name, count, "dispatched batch");
            }
            Err(err) => {
                error!(worker = %name, error = %err, "poll failed");
                if sleep_or_shutdown(shutdown_rx, backoff) {
                    break;
                }
            }
        }
    }

    info!(worker = %name, "dispatch worker stopped");
}
