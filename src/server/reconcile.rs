use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::SamplerRegistry;

/// Pushes the authoritative configuration to every dirty sampler instance.
///
/// # Behavior
/// * Sweeps on every period tick and on every dirty notification.
/// * Each sweep snapshots the dirty instances under the registry lock and calls
///   `configure` on them concurrently after releasing it.
/// * A successful push clears the instance's dirty flag unless the configuration
///   changed again meanwhile; a failed push leaves it dirty for the next sweep.
pub struct ReconciliationLoop {
    registry: Arc<SamplerRegistry>,
    period: Duration,
}

impl ReconciliationLoop {
    pub fn new(registry: Arc<SamplerRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    pub async fn run(self, mut dirty: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = dirty.recv() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.sweep() => {}
            }
        }
        debug!("reconciliation loop stopped");
    }

    /// Runs one sweep and returns how many instances were configured.
    pub async fn sweep(&self) -> usize {
        let dirty = self.registry.dirty_instances();
        if dirty.is_empty() {
            return 0;
        }
        debug!(instances = dirty.len(), "reconciling sampler configuration");

        let pushes = dirty.iter().map(|instance| instance.conn.configure(instance.config.clone()));
        let results = join_all(pushes).await;

        let mut configured = 0;
        for (instance, result) in dirty.iter().zip(results) {
            match result {
                Ok(()) => {
                    configured += 1;
                    if !self.registry.mark_clean(&instance.uid, instance.generation) {
                        debug!(sampler_uid = %instance.uid, "instance changed during configure, staying dirty");
                    }
                }
                Err(err) => warn!(
                    sampler_uid = %instance.uid,
                    sampler = %instance.key,
                    error = %err,
                    "could not configure sampler, retrying on next sweep"
                ),
            }
        }
        configured
    }
}
