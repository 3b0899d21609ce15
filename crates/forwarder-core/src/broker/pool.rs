//! Broker Client Pool — a fixed-size set of producer instances, each with its
//! own poll thread, load-balanced by topic count. See spec.md §4.1.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaResult;
use rdkafka::producer::{BaseProducer, DeliveryResult, ProducerContext};
use rdkafka::ClientContext;
use tracing::{error, info, warn};

use super::topic::TopicHandle;

/// Minimum spacing between replacement-instance creation attempts, per pool.
const INSTANCE_CREATE_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Delivery-callback context. `DeliveryOpaque` carries the `Arc<TopicHandle>`
/// the message was produced through, so the callback can update that topic's
/// counters directly without a lookup.
pub struct DeliveryContext {
    instance_id: usize,
    failed: Arc<AtomicBool>,
}

impl ClientContext for DeliveryContext {
    fn error(&self, error: rdkafka::error::KafkaError, reason: &str) {
        // Fatal, instance-wide errors arrive here. Never panic across this
        // foreign callback boundary; only set the flag (spec.md §9b).
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            error!(
                instance = self.instance_id,
                %error, reason, "broker instance reported a fatal error"
            );
            self.failed.store(true, Ordering::Release);
        }));
        if outcome.is_err() {
            // A log/format panic here must not unwind into librdkafka.
        }
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Arc<TopicHandle>;

    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        topic: Self::DeliveryOpaque,
    ) {
        let ok = delivery_result.is_ok();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            if let Err((err, _msg)) = delivery_result {
                warn!(
                    topic = %topic.topic_name,
                    error = %err,
                    "asynchronous delivery failure"
                );
            }
            topic.record_delivery(ok);
        }));
    }
}

/// One producer connection to the broker plus its dedicated poll thread.
pub struct BrokerInstance {
    pub id: usize,
    pub(super) producer: BaseProducer<DeliveryContext>,
    failed: Arc<AtomicBool>,
    topics: Mutex<HashMap<String, Weak<TopicHandle>>>,
    stop: Arc<AtomicBool>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerInstance {
    fn new(id: usize, brokers: &str) -> KafkaResult<Arc<Self>> {
        let failed = Arc::new(AtomicBool::new(false));
        let context = DeliveryContext {
            instance_id: id,
            failed: Arc::clone(&failed),
        };
        let producer: BaseProducer<DeliveryContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", format!("pv-kafka-forwarder-{id}"))
            .set("message.timeout.ms", "30000")
            .set("queue.buffering.max.messages", "100000")
            .create_with_context(context)?;

        let instance = Arc::new(Self {
            id,
            producer,
            failed,
            topics: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            poll_thread: Mutex::new(None),
        });
        instance.spawn_poll_thread();
        Ok(instance)
    }

    /// A dedicated thread repeatedly services delivery callbacks with a
    /// ~100ms timeout, exiting only when `stop` is signaled (spec.md §4.1).
    fn spawn_poll_thread(self: &Arc<Self>) {
        let instance = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        let id = self.id;
        let handle = std::thread::Builder::new()
            .name(format!("broker-poll-{id}"))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let Some(instance) = instance.upgrade() else {
                        break;
                    };
                    use rdkafka::producer::Producer;
                    // Each served callback lands in `DeliveryContext::delivery`,
                    // which increments the owning topic's own `poll_served`
                    // counter directly; nothing to attribute here.
                    instance.producer.poll(Duration::from_millis(100));
                }
            })
            .expect("failed to spawn broker poll thread");
        *self.poll_thread.lock().unwrap() = Some(handle);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn topic_count(&self) -> usize {
        let topics = self.topics.lock().unwrap();
        topics.values().filter(|w| w.strong_count() > 0).count()
    }

    /// Return the cached handle if live, sweeping expired entries as we go.
    fn get_or_create_topic(self: &Arc<Self>, topic_name: &str) -> Arc<TopicHandle> {
        let mut topics = self.topics.lock().unwrap();
        topics.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = topics.get(topic_name).and_then(|w| w.upgrade()) {
            return existing;
        }
        let handle = Arc::new(TopicHandle::new(
            topic_name.to_string(),
            self.id,
            Arc::clone(&self.failed),
            Arc::downgrade(self),
        ));
        topics.insert(topic_name.to_string(), Arc::downgrade(&handle));
        handle
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// A fixed-size, self-healing set of `BrokerInstance`s.
pub struct BrokerClientPool {
    brokers: String,
    instances: RwLock<Vec<Arc<BrokerInstance>>>,
    next_id: AtomicUsize,
    last_instance_created: Mutex<Option<Instant>>,
}

impl BrokerClientPool {
    pub fn new(brokers: impl Into<String>, initial_instances: usize) -> KafkaResult<Arc<Self>> {
        let brokers = brokers.into();
        let mut instances = Vec::with_capacity(initial_instances.max(1));
        let next_id = AtomicUsize::new(0);
        for _ in 0..initial_instances.max(1) {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            instances.push(BrokerInstance::new(id, &brokers)?);
        }
        info!(count = instances.len(), %brokers, "broker client pool started");
        Ok(Arc::new(Self {
            brokers,
            instances: RwLock::new(instances),
            next_id,
            last_instance_created: Mutex::new(None),
        }))
    }

    /// Pick the non-failed instance with the fewest topics (insertion-order
    /// tie-break); if every instance has failed, append a replacement,
    /// rate-limited to one per second per pool (spec.md §4.1).
    fn select_instance(&self) -> Option<Arc<BrokerInstance>> {
        {
            let instances = self.instances.read().unwrap();
            let best = instances
                .iter()
                .filter(|i| !i.is_failed())
                .min_by_key(|i| i.topic_count());
            if let Some(best) = best {
                return Some(Arc::clone(best));
            }
        }

        let mut last_created = self.last_instance_created.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = *last_created {
            if now.duration_since(last) < INSTANCE_CREATE_RATE_LIMIT {
                warn!("all broker instances failed; replacement rate-limited");
                return None;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match BrokerInstance::new(id, &self.brokers) {
            Ok(instance) => {
                *last_created = Some(now);
                self.instances.write().unwrap().push(Arc::clone(&instance));
                warn!(instance = id, "replaced failed broker instance");
                Some(instance)
            }
            Err(err) => {
                error!(%err, "failed to create replacement broker instance");
                None
            }
        }
    }

    /// Get or lazily create a cached `TopicHandle` for `topic_uri`, load
    /// balancing across instances on first creation.
    pub fn get_or_create_topic(&self, topic_uri: &str) -> Option<Arc<TopicHandle>> {
        // Topics are bound to whichever instance currently owns the cache
        // entry; if no instance has it yet, pick one via load balancing.
        {
            let instances = self.instances.read().unwrap();
            for instance in instances.iter() {
                let topics = instance.topics.lock().unwrap();
                if let Some(existing) = topics.get(topic_uri).and_then(|w| w.upgrade()) {
                    return Some(existing);
                }
            }
        }
        let instance = self.select_instance()?;
        Some(instance.get_or_create_topic(topic_uri))
    }

    /// Non-blocking accounting pass; the per-instance poll threads do the
    /// actual work, so this only reports aggregate health each tick.
    pub fn poll(&self) {
        // Poll threads run independently; nothing to drive here, matching
        // spec.md's division between the supervisor tick and per-instance
        // poll threads. Kept as an explicit call so the main loop's step 2
        // has a concrete target, mirroring the original's
        // `kafka_instance_set->poll()`.
    }

    pub fn stats(&self) -> Vec<(usize, Vec<(&'static str, u64)>)> {
        self.instances
            .read()
            .unwrap()
            .iter()
            .flat_map(|instance| {
                let topics = instance.topics.lock().unwrap();
                topics
                    .values()
                    .filter_map(|w| w.upgrade())
                    .map(|t| (instance.id, t.counters.snapshot()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().unwrap().len()
    }

    pub fn shutdown(&self) {
        let instances = self.instances.write().unwrap();
        for instance in instances.iter() {
            instance.stop();
        }
    }
}
