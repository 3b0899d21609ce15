//! Stream: binds one PV Client to an ordered list of Conversion Paths
//! (spec.md §4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::broker::TopicHandle;
use crate::model::{ChannelInfo, PvUpdate};
use crate::pv_client::{ClientStatus, PvClient};
use crate::registry::Converter;
use crate::worker::{ConversionTask, ConversionWorkerPool};

/// One (Converter, Topic Handle) pair — one output leg of a Stream.
pub struct ConversionPath {
    pub converter: Arc<dyn Converter>,
    pub topic: Arc<TopicHandle>,
}

impl ConversionPath {
    pub fn new(converter: Arc<dyn Converter>, topic: Arc<TopicHandle>) -> Arc<Self> {
        Arc::new(Self { converter, topic })
    }
}

/// Per-channel queue depth. Overflow increments `local_queue_full` on the
/// queue's producer side (the PV client); see `pv_client::live`/`synthetic`.
pub const DEFAULT_CHANNEL_QUEUE_DEPTH: usize = 1024;

pub struct Stream {
    pub channel: ChannelInfo,
    client: Arc<dyn PvClient>,
    paths: Vec<Arc<ConversionPath>>,
    rx: crossbeam_channel::Receiver<PvUpdate>,
    queue_full: Arc<AtomicU64>,
    dropped_worker_queue_full: AtomicU64,
}

impl Stream {
    pub fn new(
        channel: ChannelInfo,
        client: Arc<dyn PvClient>,
        paths: Vec<Arc<ConversionPath>>,
        rx: crossbeam_channel::Receiver<PvUpdate>,
        queue_full: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            client,
            paths,
            rx,
            queue_full,
            dropped_worker_queue_full: AtomicU64::new(0),
        })
    }

    pub fn client(&self) -> &Arc<dyn PvClient> {
        &self.client
    }

    pub fn paths(&self) -> &[Arc<ConversionPath>] {
        &self.paths
    }

    pub fn push_path(&mut self, path: Arc<ConversionPath>) {
        self.paths.push(path);
    }

    /// `Fatal` iff the underlying PV client is in a fatal state (spec.md
    /// §4.6 `status()`); the Stream Set's health sweep removes Streams whose
    /// status is fatal.
    pub fn status(&self) -> ClientStatus {
        self.client.status()
    }

    pub fn local_queue_full_count(&self) -> u64 {
        self.queue_full.load(Ordering::Relaxed)
    }

    pub fn worker_queue_full_count(&self) -> u64 {
        self.dropped_worker_queue_full.load(Ordering::Relaxed)
    }

    /// `{ channel_name, provider, paths: [{schema, topic}, ...] }`
    /// (spec.md §4.6 `getStatusJson()`, exact shape).
    pub fn status_json(&self) -> serde_json::Value {
        json!({
            "channel_name": self.channel.channel_name,
            "provider": self.channel.provider.to_string(),
            "paths": self.paths.iter().map(|p| json!({
                "schema": p.converter.schema_name(),
                "topic": p.topic.topic_name,
            })).collect::<Vec<_>>(),
        })
    }

    /// Drain up to `budget` updates from the per-channel queue, submitting
    /// one conversion task per Conversion Path for each update (in path
    /// order) to `workers`. Returns the number of updates drained.
    ///
    /// Updates are enqueued in client-produced order and dispatched to
    /// workers in that order; because workers run in parallel, no ordering
    /// is promised once a task leaves the scheduler (spec.md §5).
    pub fn drain_and_dispatch(&self, workers: &ConversionWorkerPool, budget: usize) -> usize {
        let mut drained = 0;
        for _ in 0..budget {
            let Ok(update) = self.rx.try_recv() else {
                break;
            };
            drained += 1;
            for path in &self.paths {
                let task = ConversionTask {
                    path: Arc::clone(path),
                    update: update.clone(),
                };
                if workers.submit(task).is_err() {
                    self.dropped_worker_queue_full
                        .fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PvValue, Provider};
    use crate::pv_client::synthetic::SyntheticClient;
    use crate::registry::SchemaRegistry;
    use crate::worker::ConversionWorkerPool;
    use std::sync::atomic::AtomicU64;

    fn make_path(pool: &crate::broker::BrokerClientPool) -> Arc<ConversionPath> {
        let registry = SchemaRegistry::with_builtin_schemas();
        let converter = registry.create("json_envelope").unwrap();
        let topic = pool.get_or_create_topic("values").unwrap();
        ConversionPath::new(converter, topic)
    }

    #[test]
    fn dispatches_one_task_per_path_per_update() {
        let Ok(pool) = crate::broker::BrokerClientPool::new("localhost:0", 1) else {
            return;
        };
        let (tx, rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client: Arc<dyn PvClient> = Arc::new(SyntheticClient::new("A", tx.clone(), queue_full.clone()));
        tx.send(PvUpdate::new("A", PvValue::Double(1.0), 1)).unwrap();

        let paths = vec![make_path(&pool), make_path(&pool)];
        let stream = Stream::new(
            ChannelInfo::new("A", Provider::Pva),
            client,
            paths,
            rx,
            queue_full,
        );

        let workers = ConversionWorkerPool::new(1, 16);
        let drained = stream.drain_and_dispatch(&workers, 10);
        assert_eq!(drained, 1);
        workers.shutdown();
    }

    #[test]
    fn status_json_matches_spec_shape() {
        let Ok(pool) = crate::broker::BrokerClientPool::new("localhost:0", 1) else {
            return;
        };
        let (tx, rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client: Arc<dyn PvClient> = Arc::new(SyntheticClient::new("A", tx, queue_full.clone()));
        let stream = Stream::new(
            ChannelInfo::new("A", Provider::Ca),
            client,
            vec![make_path(&pool)],
            rx,
            queue_full,
        );
        let json = stream.status_json();
        assert_eq!(json["channel_name"], "A");
        assert_eq!(json["provider"], "ca");
        assert_eq!(json["paths"][0]["schema"], "json_envelope");
    }
}
