//! Topic Handle — a cached producer binding to one topic on one
//! `BrokerInstance`. See spec.md §4.2.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rdkafka::message::OwnedHeaders;
use rdkafka::producer::BaseRecord;
use tracing::warn;

use crate::error::ProduceError;

use super::pool::BrokerInstance;

/// librdkafka's own message-size ceiling ("message.max.bytes" default);
/// produce() rejects anything larger before it ever reaches the client.
const MAX_MESSAGE_BYTES: usize = 1_000_000;

#[derive(Debug, Default)]
pub struct TopicCounters {
    pub produced: AtomicU64,
    pub produce_fail: AtomicU64,
    pub local_queue_full: AtomicU64,
    pub produce_cb: AtomicU64,
    pub produce_cb_fail: AtomicU64,
    pub poll_served: AtomicU64,
    pub msg_too_large: AtomicU64,
    pub produced_bytes: AtomicU64,
    pub out_queue: AtomicU64,
}

impl TopicCounters {
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("produced", self.produced.load(Ordering::Relaxed)),
            ("produce_fail", self.produce_fail.load(Ordering::Relaxed)),
            (
                "local_queue_full",
                self.local_queue_full.load(Ordering::Relaxed),
            ),
            ("produce_cb", self.produce_cb.load(Ordering::Relaxed)),
            (
                "produce_cb_fail",
                self.produce_cb_fail.load(Ordering::Relaxed),
            ),
            ("poll_served", self.poll_served.load(Ordering::Relaxed)),
            ("msg_too_large", self.msg_too_large.load(Ordering::Relaxed)),
            (
                "produced_bytes",
                self.produced_bytes.load(Ordering::Relaxed),
            ),
            ("outq", self.out_queue.load(Ordering::Relaxed)),
        ]
    }
}

/// A cached producer binding to one topic on one `BrokerInstance`.
pub struct TopicHandle {
    pub topic_name: String,
    pub instance_id: usize,
    instance_failed: Arc<AtomicBool>,
    instance: std::sync::Weak<BrokerInstance>,
    pub counters: TopicCounters,
}

impl TopicHandle {
    pub(super) fn new(
        topic_name: String,
        instance_id: usize,
        instance_failed: Arc<AtomicBool>,
        instance: std::sync::Weak<BrokerInstance>,
    ) -> Self {
        Self {
            topic_name,
            instance_id,
            instance_failed,
            instance,
            counters: TopicCounters::default(),
        }
    }

    /// `true` iff the owning broker instance has had a fatal, instance-wide
    /// failure (spec.md §4.1 "Failure semantics").
    pub fn is_unhealthy(&self) -> bool {
        self.instance_failed.load(Ordering::Acquire)
    }

    /// Hand a framed byte buffer to the broker client. Synchronous failures
    /// increment `produce_fail`/`msg_too_large` and return an error; on
    /// success the buffer's ownership transfers to librdkafka until the
    /// delivery callback fires (`produce_cb`/`produce_cb_fail`).
    pub fn produce(self: &Arc<Self>, bytes: Vec<u8>) -> Result<(), ProduceError> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            self.counters.msg_too_large.fetch_add(1, Ordering::Relaxed);
            return Err(ProduceError::TooLarge {
                topic: self.topic_name.clone(),
                size: bytes.len(),
            });
        }

        let Some(instance) = self.instance.upgrade() else {
            self.counters.produce_fail.fetch_add(1, Ordering::Relaxed);
            return Err(ProduceError::Rejected {
                topic: self.topic_name.clone(),
                reason: "owning broker instance no longer exists".into(),
            });
        };

        let byte_len = bytes.len() as u64;
        let record = BaseRecord::to(&self.topic_name)
            .payload(&bytes)
            .key("")
            .headers(OwnedHeaders::new())
            .delivery_opaque(Arc::clone(self));

        match instance.producer.send(record) {
            Ok(()) => {
                self.counters.produced.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .produced_bytes
                    .fetch_add(byte_len, Ordering::Relaxed);
                self.counters.out_queue.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err((err, _record)) => {
                self.counters.produce_fail.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic_name, error = %err, "synchronous produce rejection");
                Err(ProduceError::Rejected {
                    topic: self.topic_name.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Called from `DeliveryContext::delivery` on the instance's poll thread:
    /// one invocation is one message served by that instance's `poll()` call
    /// for this topic, so this is also where `poll_served` is counted.
    pub(super) fn record_delivery(&self, ok: bool) {
        self.counters.out_queue.fetch_sub(1, Ordering::Relaxed);
        self.counters.poll_served.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.counters.produce_cb.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.produce_cb_fail.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandle")
            .field("topic_name", &self.topic_name)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
