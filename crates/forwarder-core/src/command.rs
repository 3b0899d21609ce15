//! Command Listener & Command Protocol (spec.md §4.7).
//!
//! Commands arrive as JSON on a dedicated Kafka topic. This engine is
//! thread-driven end to end, so the listener uses `BaseConsumer` with an
//! explicit blocking `poll(timeout)` call from the supervisor's control tick,
//! rather than `StreamConsumer`'s async `recv()`.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use rdkafka::error::KafkaResult;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CommandParseError;
use crate::model::StreamSpecWire;

/// One parsed command. Unknown `cmd` values are logged and dropped rather
/// than treated as a parse error (spec.md §4.7's command table).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add { streams: Vec<StreamSpecWire> },
    StopChannel { channel: String },
    StopAll,
    Exit,
}

#[derive(Deserialize)]
struct RawCommand {
    cmd: String,
    #[serde(default)]
    streams: Vec<StreamSpecWire>,
    #[serde(default)]
    channel: Option<String>,
}

/// Parse one command message body. Never panics; malformed JSON or an
/// unrecognized `cmd` is an error the caller logs and moves past (matches
/// the original `handleCommand`'s "never fatal" behavior).
pub fn parse_command(bytes: &[u8]) -> Result<Command, CommandParseError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let raw: RawCommand = serde_json::from_value(value).map_err(CommandParseError::Json)?;
    match raw.cmd.as_str() {
        "add" => Ok(Command::Add {
            streams: raw.streams,
        }),
        "stop_channel" => {
            let channel = raw.channel.ok_or(CommandParseError::MissingCommand)?;
            Ok(Command::StopChannel { channel })
        }
        "stop_all" => Ok(Command::StopAll),
        "exit" => Ok(Command::Exit),
        other => {
            warn!(cmd = other, "unrecognized command, ignoring");
            Err(CommandParseError::MissingCommand)
        }
    }
}

/// Subscribes to the command topic at construction time, so only commands
/// published after startup are seen (spec.md §4.7 "subscribes at the current
/// high-water mark, not from the beginning").
pub struct CommandListener {
    consumer: BaseConsumer,
}

impl CommandListener {
    pub fn new(brokers: &str, topic: &str, group_id: &str) -> KafkaResult<Self> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(Self { consumer })
    }

    /// Poll once for a single command message. `None` on timeout; errors are
    /// logged by the caller and never propagated past this boundary.
    pub fn poll(&self, timeout: Duration) -> Option<Result<Command, CommandParseError>> {
        let message = match self.consumer.poll(timeout)? {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "command topic poll error");
                return None;
            }
        };
        let payload = message.payload()?;
        debug!(bytes = payload.len(), "command message received");
        Some(parse_command(payload))
    }
}
