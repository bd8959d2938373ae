use tokio::sync::mpsc;

use crate::control::SamplerConfig;

/// Configuration change of a logical sampler, for dataplane consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ConfigUpdate {
        resource: String,
        sampler: String,
        config: SamplerConfig,
    },
    ConfigDelete {
        resource: String,
        sampler: String,
    },
}

/// Fan-out of registry events, one unbounded queue per subscriber.
///
/// Publishing never blocks and never drops an event for a live subscriber;
/// subscribers whose stream was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl EventHub {
    pub(crate) fn publish(&mut self, event: RegistryEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// New subscriber whose stream starts with `initial`.
    pub(crate) fn subscribe(&mut self, initial: Vec<RegistryEvent>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in initial {
            let _ = tx.send(event);
        }
        self.subscribers.push(tx);
        EventStream { rx }
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.subscribers.len()
    }
}

/// Initial snapshot followed by every later event, in order.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl EventStream {
    /// Snapshot-only stream, for a registry whose events are already closed.
    pub(crate) fn closed(initial: Vec<RegistryEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in initial {
            let _ = tx.send(event);
        }
        Self { rx }
    }

    /// Returns `None` once the registry has closed its events and everything
    /// queued before that was delivered.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        self.rx.recv().await
    }
}
