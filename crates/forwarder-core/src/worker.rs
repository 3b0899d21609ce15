//! Conversion Worker Pool & Scheduler (spec.md §4.4).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::PvUpdate;
use crate::stream::ConversionPath;

/// One atomic output step of a Stream: a path to run and the update to run
/// it on.
pub struct ConversionTask {
    pub path: Arc<ConversionPath>,
    pub update: PvUpdate,
}

/// Returned by `submit` when the scheduler's bounded queue is full; the
/// caller (a `Stream`) counts this and drops the update.
pub struct QueueFull;

/// A fixed-size set of worker threads draining a shared, bounded task queue.
pub struct ConversionWorkerPool {
    tx: crossbeam_channel::Sender<ConversionTask>,
    handles: Vec<JoinHandle<()>>,
}

impl ConversionWorkerPool {
    /// Spawns `n_workers` threads immediately; workers are started together
    /// and stopped together by dropping the sender, which unblocks every
    /// worker's `recv()` with a channel-closed error (spec.md §4.4).
    pub fn new(n_workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<ConversionTask>(queue_size.max(1));
        let mut handles = Vec::with_capacity(n_workers.max(1));
        for id in 0..n_workers.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("conversion-worker-{id}"))
                .spawn(move || worker_loop(id, rx))
                .expect("failed to spawn conversion worker thread");
            handles.push(handle);
        }
        Self { tx, handles }
    }

    /// Enqueue a task. Returns `Err(QueueFull)` if the scheduler's queue is
    /// saturated; the caller is responsible for counting the drop.
    pub fn submit(&self, task: ConversionTask) -> Result<(), QueueFull> {
        self.tx.try_send(task).map_err(|_| QueueFull)
    }

    /// Stop accepting work, wake every worker, and join all threads before
    /// returning.
    pub fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, rx: crossbeam_channel::Receiver<ConversionTask>) {
    debug!(worker = id, "conversion worker started");
    while let Ok(task) = rx.recv_timeout(Duration::from_millis(250)) {
        run_task(task);
    }
    debug!(worker = id, "conversion worker stopped");
}

fn run_task(task: ConversionTask) {
    let topic = Arc::clone(&task.path.topic);
    match task.path.converter.convert(&task.update, Arc::clone(&topic)) {
        Ok(framed) => {
            if let Err(err) = topic.produce(framed.bytes) {
                warn!(
                    topic = %topic.topic_name,
                    schema = %framed.schema,
                    error = %err,
                    "produce failed"
                );
            }
        }
        Err(err) => {
            warn!(
                channel = %task.update.channel_name,
                error = %err,
                "conversion failed; update dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PvValue;
    use crate::registry::SchemaRegistry;

    #[test]
    fn submit_runs_on_a_worker_thread() {
        let Ok(pool) = crate::broker::BrokerClientPool::new("localhost:0", 1) else {
            return;
        };
        let registry = SchemaRegistry::with_builtin_schemas();
        let converter = registry.create("json_envelope").unwrap();
        let topic = pool.get_or_create_topic("values").unwrap();
        let path = ConversionPath::new(converter, topic);

        let workers = ConversionWorkerPool::new(2, 8);
        let update = PvUpdate::new("A", PvValue::Double(2.0), 7);
        workers
            .submit(ConversionTask {
                path,
                update,
            })
            .map_err(|_| ())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        workers.shutdown();
    }

    #[test]
    fn submit_reports_queue_full_when_saturated() {
        let Ok(pool) = crate::broker::BrokerClientPool::new("localhost:0", 1) else {
            return;
        };
        let registry = SchemaRegistry::with_builtin_schemas();
        let converter = registry.create("json_envelope").unwrap();
        let topic = pool.get_or_create_topic("values").unwrap();

        // Zero workers: nothing ever drains the queue, so it saturates fast.
        let (tx, _rx) = crossbeam_channel::bounded::<ConversionTask>(1);
        let full_tx = tx.clone();
        let path = ConversionPath::new(converter, topic);
        full_tx
            .try_send(ConversionTask {
                path: Arc::clone(&path),
                update: PvUpdate::new("A", PvValue::Double(1.0), 1),
            })
            .unwrap();
        let second = full_tx.try_send(ConversionTask {
            path,
            update: PvUpdate::new("A", PvValue::Double(2.0), 2),
        });
        assert!(second.is_err());
    }
}
