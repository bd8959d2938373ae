//! Server-side authoritative state: registered clients, logical samplers with their
//! desired configuration, and one live instance per sampler connection.
//!
//! Each registry keeps all of its state behind a single mutex. Nothing that can block
//! on the network runs under that mutex: configuration pushes collect a snapshot of
//! dirty instances first and call into their connections afterwards.
use tokio::sync::mpsc;
use thiserror::Error;

pub mod client;
pub mod events;
pub mod sampler;
pub mod storage;

pub use client::{Client, ClientRegistry};
pub use events::{EventStream, RegistryEvent};
pub use sampler::{ConfigureError, DirtyInstance, SamplerConn, SamplerIdentity, SamplerRegistry};
pub use storage::{SamplerKey, SamplerRecord, Storage, StorageError, StorageKind};

/// Registration counter returned by `register`; used to make deregistration
/// conditional on still owning the newest registration of a UID.
pub type Epoch = u64;

/// Wildcard accepted in either part of a `(resource, name)` lookup.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    #[default]
    Unknown,
    Unregistered,
    Registered,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("unknown sampler {0}")]
    UnknownSampler(SamplerKey),
    #[error("unknown sampler instance {0}")]
    UnknownSamplerInstance(String),
    #[error("no sampler matches resource {resource:?} and name {name:?}")]
    NoMatch { resource: String, name: String },
    #[error("ambiguous wildcard match: resource {resource:?} and name {name:?} match {count} samplers")]
    AmbiguousMatch {
        resource: String,
        name: String,
        count: usize,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Sending half of the depth-1 dirty channel.
///
/// Notifications coalesce: while one is pending, further ones are dropped, since the
/// receiver always sweeps every dirty instance.
#[derive(Debug, Clone)]
pub struct DirtyNotifier {
    tx: mpsc::Sender<()>,
}

impl DirtyNotifier {
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

pub fn dirty_channel() -> (DirtyNotifier, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (DirtyNotifier { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dirty_notifications_coalesce() {
        let (notifier, mut rx) = dirty_channel();
        for _ in 0..10 {
            notifier.notify();
        }
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
