//! Stream Set: the single shared registry of active Streams, keyed by
//! channel name (spec.md §4.6's "Stream Set").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::pv_client::ClientStatus;
use crate::stream::Stream;

/// `Arc<HashMap<...>>` behind one `Mutex` — matches the teacher's own
/// single-lock registry pattern rather than a sharded map, since adds/removes
/// are rare relative to the per-Stream drain loop that never touches this
/// lock.
#[derive(Default)]
pub struct StreamSet {
    streams: Mutex<HashMap<String, Arc<Stream>>>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a channel that already has a Stream; the caller maps this to
    /// `MappingAddError::DuplicateChannel` (spec.md §4.6, §8 scenario 2).
    pub fn add(&self, stream: Arc<Stream>) -> Result<(), String> {
        let channel_name = stream.channel.channel_name.clone();
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&channel_name) {
            return Err(channel_name);
        }
        streams.insert(channel_name, stream);
        Ok(())
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<Stream>> {
        self.streams.lock().unwrap().get(channel_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop one channel's client and remove it. A no-op, not an error, if
    /// the channel is unknown (spec.md §4.7 `stop_channel`).
    pub fn stop_channel(&self, channel_name: &str) {
        let removed = self.streams.lock().unwrap().remove(channel_name);
        if let Some(stream) = removed {
            stream.client().stop();
            info!(channel = channel_name, "channel stopped");
        } else {
            debug!(channel = channel_name, "stop_channel on unknown channel");
        }
    }

    /// Stop every channel's client and drop all Streams. A brief pause after
    /// calling `stop()` on each client lets in-flight foreign callbacks that
    /// already upgraded their weak handle finish before the Streams go away
    /// (spec.md §9's torn-down-state note).
    pub fn clear_streams(&self) {
        let mut streams = self.streams.lock().unwrap();
        for stream in streams.values() {
            stream.client().stop();
        }
        streams.clear();
        drop(streams);
        std::thread::sleep(Duration::from_millis(20));
    }

    /// Health sweep: remove every Stream whose client reports `Fatal`.
    /// Returns the channel names removed. Called on the supervisor's 2-second
    /// control tick (spec.md §4.8).
    pub fn check_stream_status(&self) -> Vec<String> {
        let mut streams = self.streams.lock().unwrap();
        let dead: Vec<String> = streams
            .iter()
            .filter(|(_, s)| s.status() == ClientStatus::Fatal)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            streams.remove(name);
            info!(channel = %name, "removed stream with fatal client status");
        }
        dead
    }

    pub fn status_json(&self) -> serde_json::Value {
        let streams = self.streams.lock().unwrap();
        serde_json::Value::Array(streams.values().map(|s| s.status_json()).collect())
    }

    /// Snapshot of the current channel names, for iterating without holding
    /// the lock across a drain pass.
    pub fn snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelInfo, Provider};
    use crate::pv_client::synthetic::SyntheticClient;
    use crate::pv_client::PvClient;
    use std::sync::atomic::AtomicU64;

    fn make_stream(name: &str) -> Arc<Stream> {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client: Arc<dyn PvClient> =
            Arc::new(SyntheticClient::new(name, tx, queue_full.clone()));
        Stream::new(ChannelInfo::new(name, Provider::Pva), client, vec![], rx, queue_full)
    }

    #[test]
    fn add_rejects_duplicate_channel() {
        let set = StreamSet::new();
        set.add(make_stream("A")).unwrap();
        let err = set.add(make_stream("A")).unwrap_err();
        assert_eq!(err, "A");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn stop_channel_removes_and_is_idempotent_on_unknown() {
        let set = StreamSet::new();
        set.add(make_stream("A")).unwrap();
        set.stop_channel("A");
        assert!(set.get("A").is_none());
        // Unknown channel: no panic, no error.
        set.stop_channel("does-not-exist");
    }

    #[test]
    fn clear_streams_empties_the_set() {
        let set = StreamSet::new();
        set.add(make_stream("A")).unwrap();
        set.add(make_stream("B")).unwrap();
        set.clear_streams();
        assert!(set.is_empty());
    }

    #[test]
    fn check_stream_status_removes_fatal_clients() {
        let set = StreamSet::new();
        let stream = make_stream("A");
        set.add(Arc::clone(&stream)).unwrap();
        stream.client().stop(); // SyntheticClient::stop() is a no-op so status stays Ok
        let removed = set.check_stream_status();
        assert!(removed.is_empty());
        assert_eq!(set.len(), 1);
    }
}
