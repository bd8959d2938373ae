use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::events::{EventHub, EventStream, RegistryEvent};
use super::storage::{SamplerKey, SamplerRecord, SamplerStorage};
use super::{DirtyNotifier, Epoch, RegistrationStatus, RegistryError, WILDCARD};
use crate::control::{
    Capabilities, SamplerConfig, SamplerConfigUpdate, SamplerSummary, SamplerUid, SamplingStats,
    Tag,
};
use crate::stream::StreamError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigureError {
    #[error("sampler rejected configuration: {0}")]
    Rejected(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Capability to push a full configuration to one sampler instance.
#[async_trait]
pub trait SamplerConn: Send + Sync + 'static {
    async fn configure(&self, config: SamplerConfig) -> Result<(), ConfigureError>;
}

/// What a sampler announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplerIdentity {
    pub uid: SamplerUid,
    pub resource: String,
    pub name: String,
    pub tags: Vec<Tag>,
    pub capabilities: Capabilities,
}

/// One dirty instance captured by [`SamplerRegistry::dirty_instances`].
#[derive(Clone)]
pub struct DirtyInstance {
    pub key: SamplerKey,
    pub uid: SamplerUid,
    pub generation: u64,
    pub config: SamplerConfig,
    pub conn: Arc<dyn SamplerConn>,
}

impl std::fmt::Debug for DirtyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyInstance")
            .field("key", &self.key)
            .field("uid", &self.uid)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Instance {
    conn: Arc<dyn SamplerConn>,
    status: RegistrationStatus,
    dirty: bool,
    generation: u64,
    epoch: Epoch,
    stats: SamplingStats,
}

struct Sampler {
    key: SamplerKey,
    tags: Vec<Tag>,
    capabilities: Capabilities,
    config: SamplerConfig,
    collected_samples: u64,
    instances: HashMap<SamplerUid, Instance>,
}

impl Sampler {
    fn new(key: SamplerKey, config: SamplerConfig) -> Self {
        Self {
            key,
            tags: Vec::new(),
            capabilities: Capabilities::default(),
            config,
            collected_samples: 0,
            instances: HashMap::new(),
        }
    }

    fn record(&self) -> SamplerRecord {
        SamplerRecord {
            config: self.config.clone(),
            tags: self.tags.clone(),
            capabilities: self.capabilities,
        }
    }

    fn summary(&self) -> SamplerSummary {
        let mut sampling_stats = SamplingStats::default();
        for instance in self.instances.values() {
            sampling_stats += instance.stats;
        }
        SamplerSummary {
            uid: SamplerUid::new(),
            resource: self.key.resource.clone(),
            name: self.key.name.clone(),
            tags: self.tags.clone(),
            capabilities: self.capabilities,
            config: self.config.clone(),
            sampling_stats,
            collected_samples: self.collected_samples,
        }
    }

    fn instance_summary(&self, uid: &str, instance: &Instance) -> SamplerSummary {
        SamplerSummary {
            uid: uid.to_string(),
            sampling_stats: instance.stats,
            ..self.summary()
        }
    }

    fn update_event(&self) -> RegistryEvent {
        RegistryEvent::ConfigUpdate {
            resource: self.key.resource.clone(),
            sampler: self.key.name.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Default)]
struct SamplerState {
    samplers: HashMap<SamplerKey, Sampler>,
    /// Instance UID to the logical sampler that owns it.
    owners: HashMap<SamplerUid, SamplerKey>,
    next_epoch: Epoch,
    next_generation: u64,
    next_write: u64,
    events: Option<EventHub>,
}

impl SamplerState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn owner(&self, uid: &str) -> Result<&SamplerKey, RegistryError> {
        self.owners
            .get(uid)
            .ok_or_else(|| RegistryError::UnknownSamplerInstance(uid.to_string()))
    }

    fn sampler_mut(&mut self, key: &SamplerKey) -> Result<&mut Sampler, RegistryError> {
        self.samplers
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownSampler(key.clone()))
    }

    fn emit(&mut self, event: RegistryEvent) {
        if let Some(events) = &mut self.events {
            events.publish(event);
        }
    }

    /// Marks every instance of `key` dirty with a fresh generation.
    fn mark_dirty(&mut self, key: &SamplerKey) {
        let generation = self.next_generation();
        if let Some(sampler) = self.samplers.get_mut(key) {
            for instance in sampler.instances.values_mut() {
                instance.dirty = true;
                instance.generation = generation;
            }
        }
    }
}

/// Logical samplers, their desired configuration and their live instances.
///
/// # Guarantees
/// * Registering an already registered UID replaces its instance record.
/// * Every configuration change marks all instances of the logical sampler dirty and
///   wakes the reconciliation loop through the dirty channel.
/// * A freshly registered instance is always dirty, so it receives the current
///   configuration on the next sweep.
/// * Persistence failures are logged; they never undo an in-memory change.
pub struct SamplerRegistry {
    state: Mutex<SamplerState>,
    storage: Box<SamplerStorage>,
    /// Sequence of the last record written per sampler; older records that lose
    /// the race to storage are skipped.
    written: Mutex<HashMap<SamplerKey, u64>>,
    dirty: DirtyNotifier,
}

impl SamplerRegistry {
    pub fn new(storage: Box<SamplerStorage>, dirty: DirtyNotifier) -> Self {
        Self {
            state: Mutex::new(SamplerState {
                events: Some(EventHub::default()),
                ..SamplerState::default()
            }),
            storage,
            written: Mutex::new(HashMap::new()),
            dirty,
        }
    }

    /// Populates logical samplers from storage. Returns how many were loaded.
    pub fn load(&self) -> Result<usize, RegistryError> {
        let mut records = Vec::new();
        self.storage.range(&mut |key, record| {
            records.push((key, record));
            true
        })?;

        let mut state = self.state.lock();
        let loaded = records.len();
        for (key, record) in records {
            let sampler = state
                .samplers
                .entry(key.clone())
                .or_insert_with(|| Sampler::new(key, SamplerConfig::new()));
            sampler.config = record.config;
            sampler.tags = record.tags;
            sampler.capabilities = record.capabilities;
        }
        info!(loaded, "sampler registry loaded from storage");
        Ok(loaded)
    }

    /// Releases `state`, then writes `record`. Storage I/O never runs under the
    /// state lock.
    fn persist(&self, mut state: MutexGuard<'_, SamplerState>, key: &SamplerKey, record: SamplerRecord) {
        state.next_write += 1;
        let seq = state.next_write;
        drop(state);

        let mut written = self.written.lock();
        if written.get(key).is_some_and(|last| *last > seq) {
            return;
        }
        if let Err(err) = self.storage.set(key, &record) {
            error!(sampler = %key, error = %err, "could not store sampler");
        }
        written.insert(key.clone(), seq);
    }

    /// Registers one sampler instance.
    ///
    /// The logical sampler is created on first sight with `initial_config` merged into
    /// an empty configuration; an existing one keeps its configuration and only
    /// refreshes its tags and capabilities.
    pub fn register(
        &self,
        identity: SamplerIdentity,
        initial_config: Option<&SamplerConfigUpdate>,
        conn: Arc<dyn SamplerConn>,
    ) -> Epoch {
        let key = SamplerKey::new(identity.resource, identity.name);
        let mut state = self.state.lock();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let generation = state.next_generation();

        // A UID moving to another logical sampler leaves its old instance behind.
        if let Some(previous) = state.owners.get(&identity.uid).cloned() {
            if previous != key {
                if let Some(sampler) = state.samplers.get_mut(&previous) {
                    sampler.instances.remove(&identity.uid);
                }
            }
        }

        let sampler = state.samplers.entry(key.clone()).or_insert_with(|| {
            let mut config = SamplerConfig::new();
            if let Some(update) = initial_config {
                config.merge(update);
            }
            debug!(sampler = %key, "new logical sampler");
            Sampler::new(key.clone(), config)
        });
        sampler.tags = identity.tags;
        sampler.capabilities = identity.capabilities;

        let previous = sampler.instances.insert(
            identity.uid.clone(),
            Instance {
                conn,
                status: RegistrationStatus::Registered,
                dirty: true,
                generation,
                epoch,
                stats: SamplingStats::default(),
            },
        );
        if previous.is_some_and(|p| p.status == RegistrationStatus::Registered) {
            error!(sampler_uid = %identity.uid, "reregistering an already registered sampler");
        }

        let record = sampler.record();
        let event = sampler.update_event();
        state.owners.insert(identity.uid, key.clone());
        state.emit(event);
        self.persist(state, &key, record);

        self.dirty.notify();
        epoch
    }

    /// Removes an instance.
    ///
    /// # Errors
    /// [`RegistryError::UnknownSamplerInstance`] when `uid` is not registered.
    pub fn deregister(&self, uid: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let key = state.owner(uid)?.clone();
        state.owners.remove(uid);
        if let Some(sampler) = state.samplers.get_mut(&key) {
            sampler.instances.remove(uid);
        }
        debug!(sampler_uid = %uid, sampler = %key, "sampler deregistered");
        Ok(())
    }

    /// Removes `uid` only if `epoch` is still its latest registration.
    pub fn release(&self, uid: &str, epoch: Epoch) -> bool {
        let mut state = self.state.lock();
        let Ok(key) = state.owner(uid).cloned() else {
            return false;
        };
        let Some(sampler) = state.samplers.get_mut(&key) else {
            return false;
        };
        if sampler.instances.get(uid).map(|i| i.epoch) != Some(epoch) {
            return false;
        }
        sampler.instances.remove(uid);
        state.owners.remove(uid);
        debug!(sampler_uid = %uid, sampler = %key, "sampler released");
        true
    }

    /// Merges `update` into the configuration of `(resource, name)`.
    ///
    /// # Errors
    /// [`RegistryError::UnknownSampler`] when the logical sampler does not exist.
    pub fn update_sampler_config(
        &self,
        resource: &str,
        name: &str,
        update: &SamplerConfigUpdate,
    ) -> Result<(), RegistryError> {
        let key = SamplerKey::new(resource, name);
        let mut state = self.state.lock();
        let sampler = state.sampler_mut(&key)?;
        sampler.config.merge(update);
        let record = sampler.record();
        let event = sampler.update_event();
        state.mark_dirty(&key);
        state.emit(event);
        self.persist(state, &key, record);

        self.dirty.notify();
        Ok(())
    }

    /// Resets the configuration of `(resource, name)` to empty.
    ///
    /// # Errors
    /// [`RegistryError::UnknownSampler`] when the logical sampler does not exist.
    pub fn delete_sampler_config(&self, resource: &str, name: &str) -> Result<(), RegistryError> {
        let key = SamplerKey::new(resource, name);
        let mut state = self.state.lock();
        let sampler = state.sampler_mut(&key)?;
        sampler.config = SamplerConfig::new();
        let record = sampler.record();
        state.mark_dirty(&key);
        state.emit(RegistryEvent::ConfigDelete {
            resource: key.resource.clone(),
            sampler: key.name.clone(),
        });
        self.persist(state, &key, record);

        self.dirty.notify();
        Ok(())
    }

    /// Aggregated view of one logical sampler.
    pub fn get_sampler(&self, resource: &str, name: &str) -> Option<SamplerSummary> {
        self.state
            .lock()
            .samplers
            .get(&SamplerKey::new(resource, name))
            .map(Sampler::summary)
    }

    /// Aggregated views of every logical sampler, with or without live instances.
    pub fn samplers(&self) -> Vec<SamplerSummary> {
        let state = self.state.lock();
        let mut samplers: Vec<_> = state.samplers.values().map(Sampler::summary).collect();
        samplers.sort_by(|a, b| (&a.resource, &a.name).cmp(&(&b.resource, &b.name)));
        samplers
    }

    /// One view per registered instance of `(resource, name)`.
    pub fn instances(&self, resource: &str, name: &str) -> Vec<SamplerSummary> {
        let state = self.state.lock();
        let Some(sampler) = state.samplers.get(&SamplerKey::new(resource, name)) else {
            return Vec::new();
        };
        sampler
            .instances
            .iter()
            .filter(|(_, i)| i.status == RegistrationStatus::Registered)
            .map(|(uid, i)| sampler.instance_summary(uid, i))
            .collect()
    }

    /// One view per registered instance of every logical sampler.
    pub fn get_registered_instances(&self) -> Vec<SamplerSummary> {
        let state = self.state.lock();
        state
            .samplers
            .values()
            .flat_map(|sampler| {
                sampler
                    .instances
                    .iter()
                    .filter(|(_, i)| i.status == RegistrationStatus::Registered)
                    .map(move |(uid, i)| sampler.instance_summary(uid, i))
            })
            .collect()
    }

    /// Resolves a possibly wildcarded `(resource, name)` to exactly one logical sampler.
    ///
    /// # Errors
    /// * [`RegistryError::UnknownSampler`] for an exact pair that does not exist.
    /// * [`RegistryError::NoMatch`] when a wildcard matches nothing.
    /// * [`RegistryError::AmbiguousMatch`] when a wildcard matches several samplers.
    pub fn resolve(&self, resource: &str, name: &str) -> Result<SamplerKey, RegistryError> {
        let state = self.state.lock();
        if resource != WILDCARD && name != WILDCARD {
            let key = SamplerKey::new(resource, name);
            return if state.samplers.contains_key(&key) {
                Ok(key)
            } else {
                Err(RegistryError::UnknownSampler(key))
            };
        }

        let matches = |pattern: &str, value: &str| pattern == WILDCARD || pattern == value;
        let mut found: Vec<&SamplerKey> = state
            .samplers
            .keys()
            .filter(|k| matches(resource, &k.resource) && matches(name, &k.name))
            .collect();
        match found.len() {
            0 => Err(RegistryError::NoMatch {
                resource: resource.to_string(),
                name: name.to_string(),
            }),
            1 => Ok(found.remove(0).clone()),
            count => Err(RegistryError::AmbiguousMatch {
                resource: resource.to_string(),
                name: name.to_string(),
                count,
            }),
        }
    }

    /// Logical sampler owning instance `uid`.
    pub fn resolve_uid(&self, uid: &str) -> Result<SamplerKey, RegistryError> {
        self.state.lock().owner(uid).cloned()
    }

    /// Replaces the sampling statistics last reported by instance `uid`.
    pub fn update_stats(&self, uid: &str, stats: SamplingStats) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let key = state.owner(uid)?.clone();
        let instance = state
            .sampler_mut(&key)?
            .instances
            .get_mut(uid)
            .ok_or_else(|| RegistryError::UnknownSamplerInstance(uid.to_string()))?;
        instance.stats = stats;
        Ok(())
    }

    /// Counts samples collected on behalf of `(resource, name)`, creating an implicit
    /// sampler the first time an unknown one shows up.
    pub fn update_sampler_stats(
        &self,
        resource: &str,
        name: &str,
        collected_samples: u64,
    ) -> Result<(), RegistryError> {
        let key = SamplerKey::new(resource, name);
        let mut state = self.state.lock();
        let created = !state.samplers.contains_key(&key);
        let sampler = state
            .samplers
            .entry(key.clone())
            .or_insert_with(|| Sampler::new(key.clone(), SamplerConfig::implicit()));
        sampler.collected_samples += collected_samples;
        if created {
            info!(sampler = %key, "implicit sampler created");
            let record = sampler.record();
            let event = sampler.update_event();
            state.emit(event);
            self.persist(state, &key, record);
        }
        Ok(())
    }

    /// Snapshot of every registered, dirty instance together with the configuration it
    /// should receive.
    pub fn dirty_instances(&self) -> Vec<DirtyInstance> {
        let state = self.state.lock();
        let mut dirty = Vec::new();
        for sampler in state.samplers.values() {
            for (uid, instance) in &sampler.instances {
                if instance.dirty && instance.status == RegistrationStatus::Registered {
                    dirty.push(DirtyInstance {
                        key: sampler.key.clone(),
                        uid: uid.clone(),
                        generation: instance.generation,
                        config: sampler.config.clone(),
                        conn: instance.conn.clone(),
                    });
                }
            }
        }
        dirty
    }

    /// Clears the dirty flag of `uid` unless it was marked dirty again after
    /// `generation` was captured. Returns whether the flag was cleared.
    pub fn mark_clean(&self, uid: &str, generation: u64) -> bool {
        let mut state = self.state.lock();
        let Ok(key) = state.owner(uid).cloned() else {
            return false;
        };
        let Some(instance) = state
            .samplers
            .get_mut(&key)
            .and_then(|s| s.instances.get_mut(uid))
        else {
            return false;
        };
        if instance.generation != generation {
            return false;
        }
        instance.dirty = false;
        true
    }

    /// Whether instance `uid` is waiting for a configuration push.
    pub fn is_dirty(&self, uid: &str) -> Option<bool> {
        let state = self.state.lock();
        let key = state.owners.get(uid)?;
        state
            .samplers
            .get(key)
            .and_then(|s| s.instances.get(uid))
            .map(|i| i.dirty)
    }

    /// Event stream starting with one `ConfigUpdate` per known sampler.
    ///
    /// Events are never dropped: each stream has its own unbounded queue.
    pub fn events(&self) -> EventStream {
        let mut state = self.state.lock();
        let initial = state.samplers.values().map(Sampler::update_event).collect();
        match &mut state.events {
            Some(events) => events.subscribe(initial),
            None => EventStream::closed(initial),
        }
    }

    /// Ends every event stream once it has delivered what was already queued.
    pub fn close_events(&self) {
        if self.state.lock().events.take().is_none() {
            warn!("sampler registry events already closed");
        }
    }
}
