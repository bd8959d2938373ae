use std::collections::HashMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use super::config::SamplerConfig;

pub type SamplerUid = String;
pub type ClientUid = String;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub attrs: HashMap<String, String>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: HashMap::new(),
        }
    }
}

/// Digest kinds a sampler can compute locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub struct_digest: bool,
    pub value_digest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplingStats {
    pub samples_evaluated: u64,
    pub samples_exported: u64,
    pub samples_digested: u64,
}

impl AddAssign for SamplingStats {
    fn add_assign(&mut self, rhs: Self) {
        self.samples_evaluated += rhs.samples_evaluated;
        self.samples_exported += rhs.samples_exported;
        self.samples_digested += rhs.samples_digested;
    }
}

/// Read-only view of a sampler as reported to clients and embedders.
///
/// `uid` is set when the view describes one physical instance and empty when it
/// aggregates every instance of a logical sampler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerSummary {
    pub uid: SamplerUid,
    pub resource: String,
    pub name: String,
    pub tags: Vec<Tag>,
    pub capabilities: Capabilities,
    pub config: SamplerConfig,
    pub sampling_stats: SamplingStats,
    pub collected_samples: u64,
}
