//! PV Client variants (spec.md §4.5): live and synthetic, behind one
//! interface so a `Stream` never inspects which it holds.

pub mod live;
pub mod synthetic;

use crate::model::PvUpdate;

/// Status reported to a `Stream`'s health sweep. Negative means fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Ok,
    Fatal,
}

/// Shared interface over the live and synthetic PV client variants.
pub trait PvClient: Send + Sync {
    /// Stop the underlying subscription/timer. Idempotent.
    fn stop(&self);

    /// Re-emit the most recently cached update, if any, without waiting for
    /// a new monitor event (liveness timer callback).
    fn emit_cached(&self) -> Option<PvUpdate>;

    fn status(&self) -> ClientStatus;

    /// Draw and enqueue a new synthetic update (synthetic-generation timer
    /// callback). A no-op for `LiveClient`, which only ever reacts to real
    /// monitor events.
    fn generate(&self) {}
}

pub use live::LiveClient;
pub use synthetic::SyntheticClient;
