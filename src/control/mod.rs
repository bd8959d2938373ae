//! Sampler configuration model shared by clients, samplers and the server.
//!
//! Configuration travels as full [`SamplerConfig`] snapshots towards samplers and as
//! [`SamplerConfigUpdate`] diffs from clients; the server folds diffs into the
//! authoritative snapshot with [`SamplerConfig::merge`].
pub mod config;
pub mod resources;
pub mod sampler;

pub use config::{ConfigError, ConfigReset, SamplerConfig, SamplerConfigUpdate, ValidationError};
pub use resources::{
    ComputationLocation, Digest, DigestKind, DigestUpdate, Event, EventUpdate, Keyed,
    LimiterConfig, Rule, RuleLang, SampleType, SamplingConfig, Stream, StreamUpdate, UpdateOp,
};
pub use sampler::{Capabilities, ClientUid, SamplerSummary, SamplerUid, SamplingStats, Tag};
