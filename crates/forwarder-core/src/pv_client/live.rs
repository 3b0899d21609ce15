//! Live PV Client (spec.md §4.5.1): subscribes to a real PV source through a
//! `PvProvider` and carries the `NEVER_CONNECTED -> CONNECTED <-> DISCONNECTED
//! -> DESTROYED` state machine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::ClientRuntimeError;
use crate::model::{ChannelInfo, PvUpdate};

use super::{ClientStatus, PvClient};

/// Callback invoked by the provider's own thread on every monitor event.
pub type MonitorCallback = Box<dyn Fn(PvUpdate) + Send + Sync>;

/// A post-connect transport event, reported by the provider on its own
/// thread after `monitor()` has already returned a live `Subscription`
/// (spec.md §4.5.1's `CONNECTED -> DISCONNECTED` and `-> DESTROYED` arcs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The transport lost the channel but may reconnect it later.
    Disconnected,
    /// The transport gave up on the channel for good.
    Fatal,
}

/// Callback invoked by the provider's own thread to report `LifecycleEvent`s
/// on an already-established subscription.
pub type LifecycleCallback = Box<dyn Fn(LifecycleEvent) + Send + Sync>;

/// A standing subscription to one channel, owned by the `LiveClient` while
/// `CONNECTED`. Concrete transports (`pva`, `ca`) are out of scope per
/// spec.md §1; this is the seam a real implementation plugs into.
pub trait Subscription: Send + Sync {
    fn stop(&self);
}

/// The control-system transport a `LiveClient` talks to. Out of scope per
/// spec.md §1 ("Concrete PV transport libraries... are external"); a fake
/// implementation backs the engine's own tests.
pub trait PvProvider: Send + Sync {
    /// Start monitoring `value, timeStamp, alarm` on `channel`; `on_event`
    /// fires on the provider's own thread for every update, `on_lifecycle`
    /// fires on the same thread whenever the transport itself disconnects or
    /// fatally drops the subscription after this call returns.
    fn monitor(
        &self,
        channel: &ChannelInfo,
        on_event: MonitorCallback,
        on_lifecycle: LifecycleCallback,
    ) -> Result<Box<dyn Subscription>, ClientRuntimeError>;
}

#[derive(Debug)]
enum ChannelState {
    NeverConnected,
    Connected(Box<dyn Subscription>),
    Disconnected,
    Destroyed,
}

struct LiveClientInner {
    channel: ChannelInfo,
    provider: Arc<dyn PvProvider>,
    state: Mutex<ChannelState>,
    cached: Mutex<Option<PvUpdate>>,
    queue_full: Arc<AtomicU64>,
    tx: crossbeam_channel::Sender<PvUpdate>,
}

/// Per-channel live subscriber. Cheap to clone (an `Arc` around shared
/// state); the provider's monitor callback holds only a `Weak` reference so
/// it never keeps a torn-down channel alive (spec.md §9 "weak handle to its
/// owning object that upgrades for the duration of the call").
#[derive(Clone)]
pub struct LiveClient {
    inner: Arc<LiveClientInner>,
}

impl LiveClient {
    /// Connects immediately; a failed initial connect raises `ClientRuntimeError`
    /// (the caller maps this to `MappingAddError::ClientInit`).
    pub fn new(
        channel: ChannelInfo,
        provider: Arc<dyn PvProvider>,
        tx: crossbeam_channel::Sender<PvUpdate>,
        queue_full: Arc<AtomicU64>,
    ) -> Result<Self, ClientRuntimeError> {
        let inner = Arc::new(LiveClientInner {
            channel,
            provider,
            state: Mutex::new(ChannelState::NeverConnected),
            cached: Mutex::new(None),
            queue_full,
            tx,
        });
        let client = Self { inner };
        client.connect()?;
        Ok(client)
    }

    fn connect(&self) -> Result<(), ClientRuntimeError> {
        let weak_event = Arc::downgrade(&self.inner);
        let weak_lifecycle = Arc::downgrade(&self.inner);
        let subscription = self.inner.provider.monitor(
            &self.inner.channel,
            Box::new(move |update| on_monitor_event(&weak_event, update)),
            Box::new(move |event| on_lifecycle_event(&weak_lifecycle, event)),
        )?;
        *self.inner.state.lock().unwrap() = ChannelState::Connected(subscription);
        debug!(channel = %self.inner.channel.channel_name, "channel connected");
        Ok(())
    }

    /// Transition `CONNECTED -> DISCONNECTED`, retaining the channel so a
    /// later `connect()` can bring it back.
    pub fn disconnect(&self) {
        disconnect_inner(&self.inner);
    }

    /// Transition to the terminal `DESTROYED` state. The owning Stream's
    /// health sweep removes the Stream once `status()` reports fatal.
    pub fn destroy(&self) {
        destroy_inner(&self.inner);
    }
}

/// Shared `CONNECTED -> DISCONNECTED` transition, reachable both from
/// `LiveClient::disconnect()` (command-driven) and from a provider's own
/// `LifecycleEvent::Disconnected` report.
fn disconnect_inner(inner: &LiveClientInner) {
    let mut state = inner.state.lock().unwrap();
    if matches!(&*state, ChannelState::Destroyed) {
        return;
    }
    if let ChannelState::Connected(sub) = &*state {
        sub.stop();
    }
    *state = ChannelState::Disconnected;
    warn!(channel = %inner.channel.channel_name, "channel disconnected");
}

/// Shared transition to the terminal `DESTROYED` state, reachable both from
/// `LiveClient::destroy()` (command-driven) and from a provider's own
/// `LifecycleEvent::Fatal` report.
fn destroy_inner(inner: &LiveClientInner) {
    let mut state = inner.state.lock().unwrap();
    if let ChannelState::Connected(sub) = &*state {
        sub.stop();
    }
    *state = ChannelState::Destroyed;
}

/// Runs on the provider's thread. Upgrades the weak handle only for the
/// duration of the call; never panics across this foreign boundary.
fn on_monitor_event(weak: &Weak<LiveClientInner>, update: PvUpdate) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        *inner.cached.lock().unwrap() = Some(update.clone());
        if inner.tx.try_send(update).is_err() {
            inner.queue_full.fetch_add(1, Ordering::Relaxed);
        }
    }));
}

/// Runs on the provider's thread, same contract as `on_monitor_event`: a
/// transport that drives a channel to `Disconnected` or `Fatal` after the
/// initial `monitor()` call reaches the state machine through here, since
/// nothing else in the engine calls `disconnect()`/`destroy()` for it.
fn on_lifecycle_event(weak: &Weak<LiveClientInner>, event: LifecycleEvent) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| match event {
        LifecycleEvent::Disconnected => disconnect_inner(&inner),
        LifecycleEvent::Fatal => destroy_inner(&inner),
    }));
}

impl PvClient for LiveClient {
    fn stop(&self) {
        self.destroy();
    }

    fn emit_cached(&self) -> Option<PvUpdate> {
        let cached = self.inner.cached.lock().unwrap().clone()?;
        if self.inner.tx.try_send(cached.clone()).is_err() {
            self.inner.queue_full.fetch_add(1, Ordering::Relaxed);
        }
        Some(cached)
    }

    fn status(&self) -> ClientStatus {
        match &*self.inner.state.lock().unwrap() {
            ChannelState::Destroyed => ClientStatus::Fatal,
            _ => ClientStatus::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PvValue, Provider};
    use std::sync::Mutex as StdMutex;

    struct FakeSubscription;
    impl Subscription for FakeSubscription {
        fn stop(&self) {}
    }

    /// A provider that immediately fires one event synchronously on
    /// `monitor`, and remembers the callbacks so a test can fire more,
    /// including provider-driven lifecycle transitions.
    struct FakeProvider {
        callbacks: StdMutex<Vec<MonitorCallback>>,
        lifecycle_callbacks: StdMutex<Vec<LifecycleCallback>>,
    }

    impl FakeProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                callbacks: StdMutex::new(Vec::new()),
                lifecycle_callbacks: StdMutex::new(Vec::new()),
            })
        }

        fn fire(&self, update: PvUpdate) {
            for cb in self.callbacks.lock().unwrap().iter() {
                cb(update.clone());
            }
        }

        fn fire_lifecycle(&self, event: LifecycleEvent) {
            for cb in self.lifecycle_callbacks.lock().unwrap().iter() {
                cb(event);
            }
        }
    }

    impl PvProvider for FakeProvider {
        fn monitor(
            &self,
            _channel: &ChannelInfo,
            on_event: MonitorCallback,
            on_lifecycle: LifecycleCallback,
        ) -> Result<Box<dyn Subscription>, ClientRuntimeError> {
            self.callbacks.lock().unwrap().push(on_event);
            self.lifecycle_callbacks.lock().unwrap().push(on_lifecycle);
            Ok(Box::new(FakeSubscription))
        }
    }

    #[test]
    fn connect_then_fatal_after_destroy() {
        let provider = FakeProvider::new();
        let (tx, rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client =
            LiveClient::new(ChannelInfo::new("A", Provider::Ca), provider.clone(), tx, queue_full)
                .unwrap();
        assert_eq!(client.status(), ClientStatus::Ok);

        provider.fire(PvUpdate::new("A", PvValue::Double(3.14), 42));
        let received = rx.recv().unwrap();
        assert_eq!(received.payload, PvValue::Double(3.14));

        client.destroy();
        assert_eq!(client.status(), ClientStatus::Fatal);
    }

    #[test]
    fn emit_cached_replays_last_update_without_a_new_event() {
        let provider = FakeProvider::new();
        let (tx, rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client =
            LiveClient::new(ChannelInfo::new("A", Provider::Pva), provider.clone(), tx, queue_full)
                .unwrap();
        provider.fire(PvUpdate::new("A", PvValue::Double(1.0), 1));
        let _ = rx.recv().unwrap();

        let replayed = client.emit_cached().unwrap();
        assert_eq!(replayed.payload, PvValue::Double(1.0));
        let replayed_on_queue = rx.recv().unwrap();
        assert_eq!(replayed_on_queue.payload, PvValue::Double(1.0));
    }

    #[test]
    fn queue_full_is_counted_on_overflow() {
        let provider = FakeProvider::new();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client =
            LiveClient::new(ChannelInfo::new("A", Provider::Pva), provider.clone(), tx, queue_full.clone())
                .unwrap();
        provider.fire(PvUpdate::new("A", PvValue::Double(1.0), 1));
        provider.fire(PvUpdate::new("A", PvValue::Double(2.0), 2));
        provider.fire(PvUpdate::new("A", PvValue::Double(3.0), 3));
        assert_eq!(queue_full.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn provider_driven_disconnect_recovers_but_fatal_is_terminal() {
        let provider = FakeProvider::new();
        let (tx, _rx) = crossbeam_channel::bounded(8);
        let queue_full = Arc::new(AtomicU64::new(0));
        let client =
            LiveClient::new(ChannelInfo::new("A", Provider::Ca), provider.clone(), tx, queue_full)
                .unwrap();
        assert_eq!(client.status(), ClientStatus::Ok);

        provider.fire_lifecycle(LifecycleEvent::Disconnected);
        assert_eq!(client.status(), ClientStatus::Ok);

        provider.fire_lifecycle(LifecycleEvent::Fatal);
        assert_eq!(client.status(), ClientStatus::Fatal);

        provider.fire_lifecycle(LifecycleEvent::Disconnected);
        assert_eq!(
            client.status(),
            ClientStatus::Fatal,
            "a destroyed channel stays destroyed"
        );
    }
}
