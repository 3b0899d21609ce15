//! Error taxonomy for the forwarding engine.
//!
//! Control-plane errors (`ConfigError`, `CommandParseError`, `MappingAddError`)
//! surface synchronously to whoever triggered them. Data-plane errors
//! (`ConversionError`, `ProduceError`, `QueueFull`, `ClientRuntimeError`,
//! `BrokerInstanceFailure`) are counted and logged; they never cross a thread
//! boundary as a propagated `Result`.

use thiserror::Error;

/// Malformed or missing configuration. Startup aborts on this error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// A command message was not valid JSON, or had no recognizable `cmd` field.
/// Logged, never fatal.
#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("malformed command JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command message has no \"cmd\" field")]
    MissingCommand,
}

/// One `StreamSpec` within an `add` batch failed to apply. Other specs in the
/// same batch are unaffected.
#[derive(Debug, Error)]
pub enum MappingAddError {
    #[error("channel {0} already has a stream")]
    DuplicateChannel(String),
    #[error("schema not found in registry: {0}")]
    SchemaNotFound(String),
    #[error("invalid topic URI {topic}: {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error("PV client initialization failed for channel {channel}: {source}")]
    ClientInit {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A PV client transitioned to a fatal state (disconnect exhausted, destroyed,
/// provider failure). The owning `Stream`'s health sweep removes it.
#[derive(Debug, Error)]
pub enum ClientRuntimeError {
    #[error("channel {0} was destroyed by its provider")]
    Destroyed(String),
    #[error("channel {0} initialization refused by provider: {1}")]
    InitRefused(String, String),
}

/// A `Converter` rejected an update. Counted per converter, update dropped.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("schema {schema} could not encode update from channel {channel}: {reason}")]
    EncodeFailed {
        schema: String,
        channel: String,
        reason: String,
    },
}

/// Broker rejected a produce call, synchronously or via the delivery callback.
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("synchronous produce rejection on topic {topic}: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("asynchronous delivery failure on topic {topic}: {reason}")]
    DeliveryFailed { topic: String, reason: String },
    #[error("message too large for topic {topic}: {size} bytes")]
    TooLarge { topic: String, size: usize },
}

/// Per-channel update queue was full; the update was dropped and counted.
#[derive(Debug, Error)]
#[error("local queue full for channel {0}")]
pub struct QueueFullError(pub String);

/// A broker instance in the pool hit a fatal, instance-wide error.
#[derive(Debug, Error)]
#[error("broker instance {0} failed: {1}")]
pub struct BrokerInstanceFailure(pub usize, pub String);

/// Umbrella error returned by public, synchronous engine entry points
/// (`Forwarder::add_mapping`, configuration loading, schema registration).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MappingAdd(#[from] MappingAddError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
