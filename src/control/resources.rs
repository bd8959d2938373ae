use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type StreamUid = String;
pub type DigestUid = String;
pub type EventUid = String;

/// Language a rule expression is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuleLang {
    #[default]
    Unknown,
    Cel,
}

impl fmt::Display for RuleLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleLang::Unknown => write!(f, "UNKNOWN"),
            RuleLang::Cel => write!(f, "CEL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rule {
    pub lang: RuleLang,
    pub expression: String,
}

impl Rule {
    pub fn cel(expression: impl Into<String>) -> Self {
        Self {
            lang: RuleLang::Cel,
            expression: expression.into(),
        }
    }
}

/// Per-key sampling state retention for keyed streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyed {
    pub ttl: Duration,
    pub max_keys: i32,
}

/// Subset of samples selected by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stream {
    pub uid: StreamUid,
    pub name: String,
    pub rule: Rule,
    pub export_raw_samples: bool,
    pub max_sample_size: i32,
    pub keyed: Option<Keyed>,
}

impl Stream {
    pub fn new(uid: impl Into<String>, name: impl Into<String>, rule: Rule) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            rule,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComputationLocation {
    #[default]
    Unknown,
    Sampler,
    Collector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestKind {
    St { max_processed_fields: u32 },
    Value { max_processed_fields: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub uid: DigestUid,
    pub name: String,
    pub stream_uid: StreamUid,
    pub flush_period: Duration,
    pub buffer_size: u32,
    pub computation_location: ComputationLocation,
    pub kind: DigestKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleType {
    #[default]
    Unknown,
    Raw,
    StructDigest,
    ValueDigest,
    Event,
    Config,
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleType::Unknown => "unknown",
            SampleType::Raw => "raw",
            SampleType::StructDigest => "struct-digest",
            SampleType::ValueDigest => "value-digest",
            SampleType::Event => "event",
            SampleType::Config => "config",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub limit: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub uid: EventUid,
    pub name: String,
    pub stream_uid: StreamUid,
    pub sample_type: SampleType,
    pub rule: Rule,
    pub limiter: LimiterConfig,
    pub export_template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingConfig {
    Deterministic {
        sample_rate: i32,
        sample_empty_determinant: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub op: UpdateOp,
    pub stream: Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestUpdate {
    pub op: UpdateOp,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUpdate {
    pub op: UpdateOp,
    pub event: Event,
}

pub type Streams = HashMap<StreamUid, Stream>;
pub type Digests = HashMap<DigestUid, Digest>;
pub type Events = HashMap<EventUid, Event>;
