//! Forwarder supervisor (spec.md §4.8): owns construction order, the main
//! control loop, and orderly shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::broker::BrokerClientPool;
use crate::command::Command;
use crate::error::{EngineError, MappingAddError};
use crate::metrics::{format_line, NullSink, StatsSink};
use crate::model::{ChannelInfo, StreamSpec};
use crate::pv_client::live::PvProvider;
use crate::pv_client::{LiveClient, PvClient, SyntheticClient};
use crate::registry::{Converter, SchemaRegistry};
use crate::stream::{ConversionPath, Stream, DEFAULT_CHANNEL_QUEUE_DEPTH};
use crate::stream_set::StreamSet;
use crate::timer::Timer;
use crate::worker::ConversionWorkerPool;

/// `{RUN, STOP, STOP_DUE_TO_SIGNAL}` bitset. Monotonic OR-only — a bit is
/// never cleared once set (spec.md §3, §9 "who actually stopped it" note).
pub const RUN: u8 = 0b001;
pub const STOP: u8 = 0b010;
pub const STOP_DUE_TO_SIGNAL: u8 = 0b100;

const CONTROL_TICK: Duration = Duration::from_secs(2);
const STATUS_TICK: Duration = Duration::from_secs(3);
const DRAIN_BUDGET_PER_STREAM: usize = 64;

pub struct ForwarderConfig {
    pub brokers: String,
    pub broker_instances: usize,
    pub command_topic: String,
    pub status_topic: Option<String>,
    pub conversion_threads: usize,
    pub conversion_queue_size: usize,
    pub main_poll_interval: Duration,
    pub period_ms: u64,
    pub fake_pv_period_ms: u64,
    pub initial_streams: Vec<StreamSpec>,
}

/// Raises bits on an `AtomicU8` with a compare-and-swap loop, matching the
/// original's `raiseForwardingFlag` (spec.md §9).
fn raise_flag(flag: &AtomicU8, bits: u8) {
    loop {
        let current = flag.load(Ordering::SeqCst);
        let desired = current | bits;
        if desired == current {
            return;
        }
        if flag
            .compare_exchange_weak(current, desired, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

/// Registry of every `Converter` instance the supervisor has handed out,
/// named or not, kept by weak reference purely so `report_stats` can reach
/// every live one (spec.md §4.8's `report_stats` iterates "converters" and
/// calls `stats()` on each, matching the original's `report_stats`, which
/// does not distinguish shared from per-Stream converters).
struct NamedConverterRegistry {
    converters: Mutex<HashMap<String, Weak<dyn Converter>>>,
    next_anon_id: AtomicU64,
}

impl NamedConverterRegistry {
    fn new() -> Self {
        Self {
            converters: Mutex::new(HashMap::new()),
            next_anon_id: AtomicU64::new(0),
        }
    }

    /// Look up a live named converter, or build and register a fresh one.
    /// A weak map: when every Stream referencing a name drops its Arc, the
    /// next lookup rebuilds (spec.md §9 "Shared converters").
    fn get_or_create(&self, name: &str, schema_registry: &SchemaRegistry, schema: &str) -> Option<Arc<dyn Converter>> {
        let mut converters = self.converters.lock().unwrap();
        if let Some(existing) = converters.get(name).and_then(|w| w.upgrade()) {
            return Some(existing);
        }
        let converter = schema_registry.create(schema)?;
        converters.insert(name.to_string(), Arc::downgrade(&converter));
        Some(converter)
    }

    /// Build a converter with no sharing identity (an `add` spec with no
    /// `name`), still registered under a synthetic key so it is not invisible
    /// to stats reporting.
    fn create_anonymous(&self, schema_registry: &SchemaRegistry, schema: &str) -> Option<Arc<dyn Converter>> {
        let converter = schema_registry.create(schema)?;
        let id = self.next_anon_id.fetch_add(1, Ordering::Relaxed);
        let key = format!("{schema}#{id}");
        self.converters
            .lock()
            .unwrap()
            .insert(key, Arc::downgrade(&converter));
        Some(converter)
    }

    /// Snapshot of every currently-live converter's own stats, keyed by its
    /// registry name (or synthetic anonymous key). Sweeps dead entries as a
    /// side effect, same as `StreamSet::check_stream_status` does for Streams.
    fn stats_snapshot(&self) -> Vec<(String, HashMap<String, i64>)> {
        let mut converters = self.converters.lock().unwrap();
        converters.retain(|_, weak| weak.strong_count() > 0);
        converters
            .iter()
            .filter_map(|(name, weak)| weak.upgrade().map(|c| (name.clone(), c.stats())))
            .collect()
    }
}

pub struct Forwarder {
    schema_registry: SchemaRegistry,
    broker_pool: Arc<BrokerClientPool>,
    command_listener: Option<crate::command::CommandListener>,
    /// `None` when `period_ms` is `0`: spec.md §6 requires `0` to disable the
    /// liveness re-emit timer outright, not merely register no callbacks on
    /// a running one (the original only creates the timer at all when a
    /// period is configured: `createPVUpdateTimerIfRequired`).
    liveness_timer: Option<Timer>,
    /// `None` when `fake_pv_period_ms` is `0`, for the same reason.
    synthetic_timer: Option<Timer>,
    streams: Arc<StreamSet>,
    run_flag: AtomicU8,
    named_converters: NamedConverterRegistry,
    provider: Option<Arc<dyn PvProvider>>,
    stats_sink: Arc<dyn StatsSink>,
    hostname: String,
    status_topic_name: Option<String>,
    conversion_threads: usize,
    conversion_queue_size: usize,
    main_poll_interval: Duration,
    synthetic_mode: bool,
}

impl Forwarder {
    /// Construction order (spec.md §4.8): schema registry, broker pool,
    /// converter workers (remembered, not started), command listener,
    /// timers (remembered, not started), then initial static Streams.
    pub fn new(
        config: ForwarderConfig,
        provider: Option<Arc<dyn PvProvider>>,
        stats_sink: Option<Arc<dyn StatsSink>>,
    ) -> Result<Self, EngineError> {
        let schema_registry = SchemaRegistry::with_builtin_schemas();
        let broker_pool = BrokerClientPool::new(&config.brokers, config.broker_instances)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        let command_listener = Some(
            crate::command::CommandListener::new(&config.brokers, &config.command_topic, "pv-kafka-forwarder")
                .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?,
        );
        let liveness_timer = (config.period_ms > 0)
            .then(|| Timer::new("liveness", Duration::from_millis(config.period_ms)));
        let synthetic_timer = (config.fake_pv_period_ms > 0)
            .then(|| Timer::new("synthetic", Duration::from_millis(config.fake_pv_period_ms)));

        let forwarder = Self {
            schema_registry,
            broker_pool,
            command_listener,
            liveness_timer,
            synthetic_timer,
            streams: Arc::new(StreamSet::new()),
            run_flag: AtomicU8::new(RUN),
            named_converters: NamedConverterRegistry::new(),
            provider,
            stats_sink: stats_sink.unwrap_or_else(|| Arc::new(NullSink)),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            status_topic_name: config.status_topic,
            conversion_threads: config.conversion_threads,
            conversion_queue_size: config.conversion_queue_size,
            main_poll_interval: config.main_poll_interval,
            synthetic_mode: config.fake_pv_period_ms > 0,
        };

        if let Some(timer) = &forwarder.liveness_timer {
            let streams = Arc::clone(&forwarder.streams);
            timer.add_callback(Box::new(move || {
                for stream in streams.snapshot() {
                    stream.client().emit_cached();
                }
            }));
        }
        if let Some(timer) = &forwarder.synthetic_timer {
            let streams = Arc::clone(&forwarder.streams);
            timer.add_callback(Box::new(move || {
                for stream in streams.snapshot() {
                    stream.client().generate();
                }
            }));
        }

        for spec in config.initial_streams {
            if let Err(err) = forwarder.add_mapping(spec) {
                error!(error = %err, "initial stream spec failed to apply");
            }
        }

        Ok(forwarder)
    }

    pub fn stop_forwarding(&self) {
        raise_flag(&self.run_flag, STOP);
    }

    /// Idempotent; a second signal is simply a second OR of the same bit
    /// (spec.md §6 "Signals... are idempotent").
    pub fn stop_forwarding_due_to_signal(&self) {
        raise_flag(&self.run_flag, STOP | STOP_DUE_TO_SIGNAL);
    }

    fn should_stop(&self) -> bool {
        self.run_flag.load(Ordering::SeqCst) & STOP != 0
    }

    /// Build a Stream from a `StreamSpec` and add it to the Stream Set.
    /// Re-adding an already-present channel is a no-op, not an error that
    /// propagates past this call (spec.md §8 idempotence property); other
    /// errors (bad schema, bad topic, client init) are returned so the
    /// caller can log them against the offending spec.
    pub fn add_mapping(&self, spec: StreamSpec) -> Result<(), MappingAddError> {
        if self.streams.get(&spec.channel.channel_name).is_some() {
            debug!(channel = %spec.channel.channel_name, "add_mapping on existing channel is a no-op");
            return Ok(());
        }

        let mut paths = Vec::with_capacity(spec.converters.len());
        for converter_spec in &spec.converters {
            if !self.schema_registry.contains(&converter_spec.schema) {
                return Err(MappingAddError::SchemaNotFound(converter_spec.schema.clone()));
            }
            if converter_spec.topic.trim().is_empty() {
                return Err(MappingAddError::InvalidTopic {
                    topic: converter_spec.topic.clone(),
                    reason: "topic must not be empty".to_string(),
                });
            }
            let converter = match &converter_spec.name {
                Some(name) => self
                    .named_converters
                    .get_or_create(name, &self.schema_registry, &converter_spec.schema)
                    .ok_or_else(|| MappingAddError::SchemaNotFound(converter_spec.schema.clone()))?,
                None => self
                    .named_converters
                    .create_anonymous(&self.schema_registry, &converter_spec.schema)
                    .ok_or_else(|| MappingAddError::SchemaNotFound(converter_spec.schema.clone()))?,
            };
            let topic = self
                .broker_pool
                .get_or_create_topic(&converter_spec.topic)
                .ok_or_else(|| MappingAddError::InvalidTopic {
                    topic: converter_spec.topic.clone(),
                    reason: "no healthy broker instance available".to_string(),
                })?;
            paths.push(ConversionPath::new(converter, topic));
        }

        let (tx, rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_QUEUE_DEPTH);
        let queue_full = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let client: Arc<dyn PvClient> = self.build_client(&spec.channel, tx, Arc::clone(&queue_full))?;

        let stream = Stream::new(spec.channel.clone(), client, paths, rx, queue_full);
        if let Err(channel_name) = self.streams.add(stream) {
            return Err(MappingAddError::DuplicateChannel(channel_name));
        }
        info!(channel = %spec.channel.channel_name, "stream added");
        Ok(())
    }

    fn build_client(
        &self,
        channel: &ChannelInfo,
        tx: crossbeam_channel::Sender<crate::model::PvUpdate>,
        queue_full: Arc<std::sync::atomic::AtomicU64>,
    ) -> Result<Arc<dyn PvClient>, MappingAddError> {
        if self.synthetic_mode {
            return Ok(Arc::new(SyntheticClient::new(
                channel.channel_name.clone(),
                tx,
                queue_full,
            )));
        }
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| MappingAddError::ClientInit {
                channel: channel.channel_name.clone(),
                source: anyhow::anyhow!("no PV provider configured"),
            })?;
        let client = LiveClient::new(channel.clone(), provider, tx, queue_full).map_err(|e| {
            MappingAddError::ClientInit {
                channel: channel.channel_name.clone(),
                source: anyhow::anyhow!(e),
            }
        })?;
        Ok(Arc::new(client))
    }

    /// Apply one parsed `Command`, same as a message from the command topic
    /// would be (spec.md §4.7). Public so a caller that already parsed a
    /// command off its own channel can drive the supervisor directly.
    pub fn apply_command(&self, command: Command) {
        match command {
            Command::Add { streams } => {
                for wire in streams {
                    let spec = wire.into_spec();
                    let channel = spec.channel.channel_name.clone();
                    if let Err(err) = self.add_mapping(spec) {
                        warn!(channel = %channel, error = %err, "add_mapping failed for spec");
                    }
                }
            }
            Command::StopChannel { channel } => self.streams.stop_channel(&channel),
            Command::StopAll => self.streams.clear_streams(),
            Command::Exit => self.stop_forwarding(),
        }
    }

    fn report_status(&self) {
        let Some(topic_name) = &self.status_topic_name else {
            return;
        };
        let Some(topic) = self.broker_pool.get_or_create_topic(topic_name) else {
            return;
        };
        let body = serde_json::json!({ "streams": self.streams.status_json() });
        if let Ok(bytes) = serde_json::to_vec(&body) {
            if let Err(err) = topic.produce(bytes) {
                warn!(error = %err, "failed to publish status");
            }
        }
    }

    /// One InfluxDB line-protocol record per broker topic's counters, plus
    /// one per live converter — named or anonymous (spec.md §6 metrics
    /// format; the converter half is grounded in the original's
    /// `report_stats`, which iterates every converter and calls `stats()`).
    fn report_stats(&self) {
        for (instance_id, counters) in self.broker_pool.stats() {
            let fields: Vec<(&str, u64)> = counters;
            let line = format_line(
                "forward-epics-to-kafka",
                &[("hostname", self.hostname.as_str()), ("set", &instance_id.to_string())],
                &fields,
            );
            self.stats_sink.send(&line);
        }

        for (name, stats) in self.named_converters.stats_snapshot() {
            let fields: Vec<(&str, u64)> = stats
                .iter()
                .map(|(k, v)| (k.as_str(), (*v).max(0) as u64))
                .collect();
            let line = format_line(
                "forward-epics-to-kafka-converter",
                &[("hostname", self.hostname.as_str()), ("name", name.as_str())],
                &fields,
            );
            self.stats_sink.send(&line);
        }
    }

    /// Blocking main loop (`forwardEpicsToKafka` in the original). Starts
    /// the converter workers and timers here — constructed earlier but not
    /// started until now (spec.md §4.8 construction order).
    pub fn forward_to_broker(&self) {
        let workers = ConversionWorkerPool::new(self.conversion_threads, self.conversion_queue_size);
        if let Some(timer) = &self.liveness_timer {
            timer.start();
        }
        if let Some(timer) = &self.synthetic_timer {
            timer.start();
        }

        let mut last_control_tick = Instant::now() - CONTROL_TICK;
        let mut last_status_emit = Instant::now() - STATUS_TICK;

        while !self.should_stop() {
            let tick_start = Instant::now();
            let mut stats_cycle = false;

            if tick_start.duration_since(last_control_tick) >= CONTROL_TICK {
                if let Some(listener) = &self.command_listener {
                    if let Some(result) = listener.poll(Duration::from_millis(0)) {
                        match result {
                            Ok(command) => self.apply_command(command),
                            Err(err) => warn!(error = %err, "malformed command"),
                        }
                    }
                }
                let removed = self.streams.check_stream_status();
                for name in removed {
                    debug!(channel = %name, "stream removed by health sweep");
                }
                stats_cycle = true;
                last_control_tick = tick_start;
            }

            self.broker_pool.poll();

            for stream in self.streams.snapshot() {
                stream.drain_and_dispatch(&workers, DRAIN_BUDGET_PER_STREAM);
            }

            if tick_start.duration_since(last_status_emit) >= STATUS_TICK {
                self.report_status();
                last_status_emit = tick_start;
            }

            if stats_cycle {
                self.report_stats();
            }

            let elapsed = tick_start.elapsed();
            if elapsed > self.main_poll_interval {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "slow main loop");
            } else {
                std::thread::sleep(self.main_poll_interval - elapsed);
            }
        }

        info!("stop requested; shutting down");
        if let Some(timer) = &self.liveness_timer {
            timer.trigger_stop();
        }
        if let Some(timer) = &self.synthetic_timer {
            timer.trigger_stop();
        }
        if let Some(timer) = &self.liveness_timer {
            timer.wait_for_stop();
        }
        if let Some(timer) = &self.synthetic_timer {
            timer.wait_for_stop();
        }
        self.streams.clear_streams();
        workers.shutdown();
        self.broker_pool.shutdown();
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::model::StreamSpecWire;

    fn config(period_ms: u64, fake_pv_period_ms: u64) -> ForwarderConfig {
        ForwarderConfig {
            brokers: "localhost:9092".to_string(),
            broker_instances: 1,
            command_topic: "pv-forwarder-commands".to_string(),
            status_topic: None,
            conversion_threads: 1,
            conversion_queue_size: 8,
            main_poll_interval: Duration::from_millis(5),
            period_ms,
            fake_pv_period_ms,
            initial_streams: vec![],
        }
    }

    fn try_forwarder(period_ms: u64, fake_pv_period_ms: u64) -> Option<Forwarder> {
        Forwarder::new(config(period_ms, fake_pv_period_ms), None, None).ok()
    }

    fn add(forwarder: &Forwarder, channel: &str) {
        let wire: StreamSpecWire = serde_json::from_str(&format!(
            r#"{{"channel":"{channel}","converter":{{"schema":"f142","topic":"values"}}}}"#
        ))
        .unwrap();
        forwarder.add_mapping(wire.into_spec()).unwrap();
    }

    #[test]
    fn zero_period_disables_the_liveness_timer() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        assert!(forwarder.liveness_timer.is_none());
        assert!(forwarder.synthetic_timer.is_some());
    }

    #[test]
    fn zero_fake_pv_period_disables_the_synthetic_timer() {
        let Some(forwarder) = try_forwarder(100, 0) else {
            return;
        };
        assert!(forwarder.liveness_timer.is_some());
        assert!(forwarder.synthetic_timer.is_none());
    }

    #[test]
    fn apply_command_add_and_stop_channel() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        add(&forwarder, "A");
        assert_eq!(forwarder.stream_count(), 1);

        forwarder.apply_command(Command::StopChannel {
            channel: "A".to_string(),
        });
        assert_eq!(forwarder.stream_count(), 0);
    }

    #[test]
    fn apply_command_stop_all() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        add(&forwarder, "A");
        add(&forwarder, "B");
        assert_eq!(forwarder.stream_count(), 2);

        forwarder.apply_command(Command::StopAll);
        assert_eq!(forwarder.stream_count(), 0);
    }

    #[test]
    fn apply_command_exit_raises_stop() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        assert!(!forwarder.should_stop());
        forwarder.apply_command(Command::Exit);
        assert!(forwarder.should_stop());
    }

    #[test]
    fn stop_forwarding_due_to_signal_sets_both_bits() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        forwarder.stop_forwarding_due_to_signal();
        let flags = forwarder.run_flag.load(Ordering::SeqCst);
        assert_eq!(flags & STOP, STOP);
        assert_eq!(flags & STOP_DUE_TO_SIGNAL, STOP_DUE_TO_SIGNAL);
    }

    #[test]
    fn named_converter_is_shared_across_streams_and_reports_stats() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        let wire_a: StreamSpecWire = serde_json::from_str(
            r#"{"channel":"A","converter":{"schema":"f142","topic":"values","name":"shared"}}"#,
        )
        .unwrap();
        let wire_b: StreamSpecWire = serde_json::from_str(
            r#"{"channel":"B","converter":{"schema":"f142","topic":"values","name":"shared"}}"#,
        )
        .unwrap();
        forwarder.add_mapping(wire_a.into_spec()).unwrap();
        forwarder.add_mapping(wire_b.into_spec()).unwrap();

        let snapshot = forwarder.named_converters.stats_snapshot();
        assert_eq!(snapshot.len(), 1, "both streams share one registered converter");
        assert_eq!(snapshot[0].0, "shared");
    }

    #[test]
    fn anonymous_converters_are_each_tracked_separately() {
        let Some(forwarder) = try_forwarder(0, 50) else {
            return;
        };
        add(&forwarder, "A");
        add(&forwarder, "B");

        let snapshot = forwarder.named_converters.stats_snapshot();
        assert_eq!(snapshot.len(), 2, "unnamed converters get distinct synthetic keys");
    }
}
