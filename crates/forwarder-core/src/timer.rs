//! Periodic callback timers (spec.md §4.7's liveness re-emit and synthetic
//! generation timers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

type Callback = Box<dyn Fn() + Send + Sync>;

/// A named thread that invokes every registered callback once per period,
/// until `trigger_stop()` is called. `wait_for_stop()` joins the thread.
pub struct Timer {
    name: String,
    period: Duration,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Register a callback to run on every tick. Callbacks registered after
    /// `start()` still take effect on the next tick.
    pub fn add_callback(&self, callback: Callback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Spawn the timer's thread. Idempotent: calling twice has no effect.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let callbacks = Arc::clone(&self.callbacks);
        let stop = Arc::clone(&self.stop);
        let period = self.period;
        let name = self.name.clone();
        *handle = Some(
            std::thread::Builder::new()
                .name(format!("timer-{name}"))
                .spawn(move || timer_loop(name, period, callbacks, stop))
                .expect("failed to spawn timer thread"),
        );
    }

    pub fn trigger_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn wait_for_stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(name: String, period: Duration, callbacks: Arc<Mutex<Vec<Callback>>>, stop: Arc<AtomicBool>) {
    debug!(timer = %name, period_ms = period.as_millis() as u64, "timer started");
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(period);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        for cb in callbacks.lock().unwrap().iter() {
            cb();
        }
    }
    debug!(timer = %name, "timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn fires_registered_callbacks_periodically() {
        let timer = Timer::new("test", Duration::from_millis(10));
        let count = Arc::new(AtomicU64::new(0));
        let count2 = Arc::clone(&count);
        timer.add_callback(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        timer.start();
        std::thread::sleep(Duration::from_millis(55));
        timer.trigger_stop();
        timer.wait_for_stop();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn start_is_idempotent() {
        let timer = Timer::new("test", Duration::from_millis(500));
        timer.start();
        timer.start();
        timer.trigger_stop();
        timer.wait_for_stop();
    }
}
