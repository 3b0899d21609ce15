//! PV-to-broker forwarding engine.
//!
//! See `SPEC_FULL.md` at the workspace root for the full module map. The
//! `Forwarder` in [`forwarder`] is the supervisor that wires everything
//! below it together.

pub mod broker;
pub mod command;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod model;
pub mod pv_client;
pub mod registry;
pub mod stream;
pub mod stream_set;
pub mod timer;
pub mod worker;

pub use error::EngineError;
pub use forwarder::{Forwarder, ForwarderConfig};
pub use model::{ChannelInfo, ConverterSpec, PvUpdate, PvValue, Provider, StreamSpec};
