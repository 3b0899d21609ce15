//! Shared data model: `ChannelInfo`, `ConverterSpec`, `StreamSpec`, `PvUpdate`,
//! `FramedMessage`. See spec.md §3 and SPEC_FULL.md's data-model section.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::topic::TopicHandle;

/// The control-system transport a channel is subscribed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Pva,
    Ca,
}

impl Default for Provider {
    fn default() -> Self {
        // spec.md §8: "Default provider is `pva` when omitted."
        Provider::Pva
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Pva => write!(f, "pva"),
            Provider::Ca => write!(f, "ca"),
        }
    }
}

/// Identity of a single PV subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_name: String,
    #[serde(default)]
    pub provider: Provider,
}

impl ChannelInfo {
    pub fn new(channel_name: impl Into<String>, provider: Provider) -> Self {
        Self {
            channel_name: channel_name.into(),
            provider,
        }
    }
}

/// One leg of a Stream's fan-out: a schema name, a destination topic, and an
/// optional identity enabling cross-Stream sharing of the Converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterSpec {
    pub schema: String,
    pub topic: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Either a single converter or a list; accepted on the wire per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConverterSpecList {
    One(ConverterSpec),
    Many(Vec<ConverterSpec>),
}

impl ConverterSpecList {
    pub fn into_vec(self) -> Vec<ConverterSpec> {
        match self {
            ConverterSpecList::One(c) => vec![c],
            ConverterSpecList::Many(cs) => cs,
        }
    }
}

/// Wire shape of one entry in an `add` command's `streams` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpecWire {
    pub channel: String,
    #[serde(default, rename = "channel_provider_type")]
    pub channel_provider_type: Provider,
    #[serde(default)]
    pub converter: Option<ConverterSpecList>,
}

impl StreamSpecWire {
    pub fn into_spec(self) -> StreamSpec {
        StreamSpec {
            channel: ChannelInfo::new(self.channel, self.channel_provider_type),
            converters: self
                .converter
                .map(ConverterSpecList::into_vec)
                .unwrap_or_default(),
        }
    }
}

/// A fully-resolved request to bind one channel to an ordered list of
/// conversion paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub channel: ChannelInfo,
    pub converters: Vec<ConverterSpec>,
}

/// The scalar payload carried by a PV update. Spec.md leaves the PV transport
/// external and its payload "provider-native structured"; this is the closed
/// set of variants this engine's converters and synthetic client need.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Double(f64),
    Int(i64),
    Str(String),
}

impl PvValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Double(v) => Some(*v),
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Str(_) => None,
        }
    }
}

/// One monitor event (or liveness/synthetic re-emission) for a single channel.
///
/// Owned exclusively by its queue slot until the last Conversion Path
/// serializes it (spec.md §3 ownership invariant); in Rust this is simply
/// enforced by move semantics plus `Clone` where more than one path needs
/// its own copy to convert independently.
#[derive(Debug, Clone, PartialEq)]
pub struct PvUpdate {
    pub channel_name: String,
    pub payload: PvValue,
    pub timestamp_ns: i64,
}

impl PvUpdate {
    pub fn new(channel_name: impl Into<String>, payload: PvValue, timestamp_ns: i64) -> Self {
        Self {
            channel_name: channel_name.into(),
            payload,
            timestamp_ns,
        }
    }
}

/// A framed, schema-tagged byte buffer ready for a single broker topic.
/// Ownership transfers to the `TopicHandle` on `produce`, and from there to
/// the broker client library until the delivery callback fires.
#[derive(Debug, Clone)]
pub struct FramedMessage {
    pub bytes: Vec<u8>,
    pub schema: String,
    pub topic: Arc<TopicHandle>,
}

impl FramedMessage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
