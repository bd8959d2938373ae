//! Wire messages exchanged on the `ClientConn` and `SamplerConn` endpoints.
//!
//! Each direction of each endpoint has its own payload sum type; every payload
//! travels inside an [`Envelope`] carrying the sender UID and a timestamp, wrapped in
//! a [`Frame`] so transports can interleave keep-alives.
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::control::{
    Capabilities, SamplerConfig, SamplerConfigUpdate, SamplerSummary, SamplerUid, SamplingStats,
    Tag,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub uid: String,
    pub timestamp_ms: u64,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(uid: impl Into<String>, payload: P) -> Self {
        Self {
            uid: uid.into(),
            timestamp_ms: now_ms(),
            payload,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame<P> {
    Message(Envelope<P>),
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Ok,
    BadRequest,
    Error,
    Unknown,
}

/// Outcome attached to every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            kind: StatusKind::Ok,
            message: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::BadRequest,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Error,
            message: Some(message.into()),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Unknown,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) => format!("{:?}: {}", self.kind, message),
            None => format!("{:?}", self.kind),
        }
    }
}

/// Which sampler a client request refers to. `*` in either field of
/// [`SamplerTarget::Name`] matches any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerTarget {
    Uid(SamplerUid),
    Name { resource: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureSamplerReq {
    pub target: SamplerTarget,
    /// `None` deletes the sampler configuration.
    pub update: Option<SamplerConfigUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientToServer {
    RegisterReq,
    ListSamplersReq,
    ConfigureSamplerReq(ConfigureSamplerReq),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerToClient {
    RegisterRes(Status),
    ListSamplersRes {
        status: Status,
        samplers: Vec<SamplerSummary>,
    },
    ConfigureSamplerRes(Status),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerRegisterReq {
    pub resource: String,
    pub name: String,
    pub tags: Vec<Tag>,
    pub capabilities: Capabilities,
    pub initial_config: Option<SamplerConfigUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerToServer {
    RegisterReq(SamplerRegisterReq),
    ConfigureRes(Status),
    Stats(SamplingStats),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerToSampler {
    RegisterRes(Status),
    ConfigureReq(SamplerConfig),
}

/// Endpoint selected by the connection preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Client,
    Sampler,
}

/// First frame on every TCP connection, before any [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub endpoint: Endpoint,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub status: Status,
}
