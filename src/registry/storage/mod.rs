//! Key/value persistence behind the sampler registry.
//!
//! The registry persists one record per logical sampler so configuration survives a
//! server restart. Backends are synchronous and are called after the registry has
//! released its state lock; writes for one registry are serialized.
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{Capabilities, SamplerConfig, Tag};

mod disk;
mod memory;
mod nop;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use nop::NopStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown key")]
    UnknownKey,
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid storage entry {0}")]
    InvalidEntry(String),
}

pub trait Storage<K, V>: Send + Sync {
    /// # Errors
    /// [`StorageError::UnknownKey`] when nothing is stored under `key`.
    fn get(&self, key: &K) -> Result<V, StorageError>;

    fn set(&self, key: &K, value: &V) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &K) -> Result<(), StorageError>;

    /// Calls `f` for every stored entry until it returns `false`.
    fn range(&self, f: &mut dyn FnMut(K, V) -> bool) -> Result<(), StorageError>;
}

/// Identity of a logical sampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SamplerKey {
    pub resource: String,
    pub name: String,
}

impl SamplerKey {
    pub fn new(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SamplerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource, self.name)
    }
}

/// Persisted part of a logical sampler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerRecord {
    pub config: SamplerConfig,
    pub tags: Vec<Tag>,
    pub capabilities: Capabilities,
}

pub type SamplerStorage = dyn Storage<SamplerKey, SamplerRecord>;

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageKind {
    /// Nothing is persisted.
    #[default]
    Nop,
    /// Kept for the lifetime of the process only.
    Memory,
    /// One JSON file per sampler under the given directory.
    Disk(PathBuf),
}

impl StorageKind {
    pub fn build(&self) -> Result<Box<SamplerStorage>, StorageError> {
        Ok(match self {
            StorageKind::Nop => Box::new(NopStorage),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::Disk(dir) => Box::new(DiskStorage::open(dir)?),
        })
    }
}
