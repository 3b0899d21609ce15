//! Synthetic PV Client (spec.md §4.5.2): generates a scalar double on demand
//! so the pipeline can be exercised without a live PV source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::model::{PvUpdate, PvValue};

use super::{ClientStatus, PvClient};

pub struct SyntheticClient {
    channel_name: String,
    cached: Mutex<Option<PvUpdate>>,
    queue_full: Arc<AtomicU64>,
    tx: crossbeam_channel::Sender<PvUpdate>,
}

impl SyntheticClient {
    pub fn new(
        channel_name: impl Into<String>,
        tx: crossbeam_channel::Sender<PvUpdate>,
        queue_full: Arc<AtomicU64>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            cached: Mutex::new(None),
            queue_full,
            tx,
        }
    }

    /// Draw a scalar double uniformly from `[0, 1)`, stamp it with the
    /// current wall-clock time, and enqueue it exactly like a live monitor
    /// event would. Called by the synthetic-update timer's callback.
    pub fn generate(&self) {
        let value = rand::thread_rng().gen_range(0.0..1.0);
        let timestamp_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let update = PvUpdate::new(self.channel_name.clone(), PvValue::Double(value), timestamp_ns);
        *self.cached.lock().unwrap() = Some(update.clone());
        if self.tx.try_send(update).is_err() {
            self.queue_full.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl PvClient for SyntheticClient {
    fn stop(&self) {
        // No subscription to tear down; the timer that drives `generate()`
        // is stopped independently by whoever owns it.
    }

    fn emit_cached(&self) -> Option<PvUpdate> {
        let cached = self.cached.lock().unwrap().clone()?;
        if self.tx.try_send(cached.clone()).is_err() {
            self.queue_full.fetch_add(1, Ordering::Relaxed);
        }
        Some(cached)
    }

    fn status(&self) -> ClientStatus {
        // The synthetic client never fails on its own; it only stops
        // generating when its timer callback is removed.
        ClientStatus::Ok
    }

    fn generate(&self) {
        SyntheticClient::generate(self);
    }
}
