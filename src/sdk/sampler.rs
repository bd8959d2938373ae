use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{ClientError, ClientOptions, Supervised};
use crate::control::{Capabilities, SamplerConfig, SamplerConfigUpdate, SamplingStats, Tag};
use crate::messages::{
    Endpoint, Envelope, SamplerRegisterReq, SamplerToServer, ServerToSampler, Status,
};
use crate::stream::{
    Dispatch, Handler, Registrant, StreamEngine, StreamError, StreamHandle, StreamState,
};
use crate::transport::{Connector, TcpConnector};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerEvent {
    /// The server pushed a new full configuration.
    ConfigUpdate(SamplerConfig),
    StateUpdate(StreamState),
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub client: ClientOptions,
    pub tags: Vec<Tag>,
    pub capabilities: Capabilities,
    /// Sent with every registration; applied only when the server creates the
    /// logical sampler.
    pub initial_config: Option<SamplerConfigUpdate>,
    /// Period of the statistics push; `None` disables it.
    pub stats_period: Option<Duration>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            tags: Vec::new(),
            capabilities: Capabilities::default(),
            initial_config: None,
            stats_period: Some(Duration::from_secs(5)),
        }
    }
}

impl SamplerOptions {
    pub fn with_client(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    pub fn with_initial_config(mut self, update: SamplerConfigUpdate) -> Self {
        self.initial_config = Some(update);
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_stats_period(mut self, period: Option<Duration>) -> Self {
        self.stats_period = period;
        self
    }
}

/// Sampler side of the `SamplerConn` protocol.
pub struct SamplerProtocol {
    registration: SamplerRegisterReq,
    config: Mutex<Option<SamplerConfig>>,
    events: broadcast::Sender<SamplerEvent>,
}

#[async_trait]
impl Handler for SamplerProtocol {
    type Out = SamplerToServer;
    type In = ServerToSampler;

    async fn handle(
        &self,
        msg: Envelope<ServerToSampler>,
    ) -> Result<Dispatch<ServerToSampler, SamplerToServer>, StreamError> {
        match msg.payload {
            ServerToSampler::ConfigureReq(config) => {
                debug!(server_uid = %msg.uid, "configuration received");
                *self.config.lock() = Some(config.clone());
                let _ = self.events.send(SamplerEvent::ConfigUpdate(config));
                Ok(Dispatch::Handled(Some(SamplerToServer::ConfigureRes(Status::ok()))))
            }
            ServerToSampler::RegisterRes(status) => {
                warn!(status = %status.describe(), "ignoring registration response on a registered stream");
                Ok(Dispatch::Handled(None))
            }
        }
    }

    fn on_state_change(&self, state: StreamState) {
        let _ = self.events.send(SamplerEvent::StateUpdate(state));
    }
}

impl Registrant for SamplerProtocol {
    fn registration_request(&self) -> SamplerToServer {
        SamplerToServer::RegisterReq(self.registration.clone())
    }

    fn check_registration_response(&self, msg: &Envelope<ServerToSampler>) -> Result<(), StreamError> {
        match &msg.payload {
            ServerToSampler::RegisterRes(status) if status.is_ok() => Ok(()),
            ServerToSampler::RegisterRes(status) => {
                Err(StreamError::RegistrationFailure(status.describe()))
            }
            other => Err(StreamError::RegistrationFailure(format!(
                "unexpected registration response {other:?}"
            ))),
        }
    }
}

/// In-process sampler registration: receives configuration from the server and
/// reports sampling statistics back.
///
/// # Behavior
/// * The UID is a fresh UUID per instance; `(resource, name)` is the logical identity
///   shared by every replica.
/// * Every (re)registration gets the full current configuration from the server;
///   [`Sampler::config`] always holds the latest one received.
/// * While registered, statistics are pushed every `stats_period`.
pub struct Sampler {
    uid: String,
    resource: String,
    name: String,
    protocol: Arc<SamplerProtocol>,
    stream: Supervised<SamplerProtocol>,
    stats: Arc<Mutex<SamplingStats>>,
    stats_period: Option<Duration>,
    stats_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Sampler {
    pub fn new(
        resource: impl Into<String>,
        name: impl Into<String>,
        connector: Arc<dyn Connector<SamplerToServer, ServerToSampler>>,
        options: SamplerOptions,
    ) -> Self {
        let uid = Uuid::new_v4().to_string();
        let resource = resource.into();
        let name = name.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let protocol = Arc::new(SamplerProtocol {
            registration: SamplerRegisterReq {
                resource: resource.clone(),
                name: name.clone(),
                tags: options.tags.clone(),
                capabilities: options.capabilities,
                initial_config: options.initial_config.clone(),
            },
            config: Mutex::new(None),
            events,
        });
        let engine = StreamEngine::new(
            uid.clone(),
            protocol.clone(),
            connector,
            options.client.stream.clone(),
        );
        Self {
            uid,
            resource,
            name,
            protocol,
            stream: Supervised::new(engine, &options.client),
            stats: Arc::new(Mutex::new(SamplingStats::default())),
            stats_period: options.stats_period,
            stats_task: Mutex::new(None),
        }
    }

    /// Sampler talking to a server at `addr` over TCP.
    pub fn tcp(
        addr: impl Into<String>,
        resource: impl Into<String>,
        name: impl Into<String>,
        options: SamplerOptions,
    ) -> Result<Self, ClientError> {
        let connector = TcpConnector::new(addr, Endpoint::Sampler, options.client.connect.clone())?;
        Ok(Self::new(resource, name, Arc::new(connector), options))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.stream.engine().state()
    }

    /// Latest configuration pushed by the server, if any.
    pub fn config(&self) -> Option<SamplerConfig> {
        self.protocol.config.lock().clone()
    }

    /// Subscribes to configuration and state updates from now on.
    pub fn events(&self) -> broadcast::Receiver<SamplerEvent> {
        self.protocol.events.subscribe()
    }

    /// Registers with the server and starts the background statistics push.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.stream.connect().await?;
        info!(sampler_uid = %self.uid, resource = %self.resource, sampler = %self.name, "sampler connected");
        if let Some(period) = self.stats_period {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(
                push_stats_periodically(
                    self.stream.engine().handle(),
                    self.stats.clone(),
                    period,
                    cancel.clone(),
                )
                .instrument(info_span!("sampler_stats", sampler_uid = %self.uid)),
            );
            if let Some((previous, _)) = self.stats_task.lock().replace((cancel, task)) {
                previous.cancel();
            }
        }
        Ok(())
    }

    /// Adds to the counters reported with the next statistics push.
    pub fn record_samples(&self, stats: SamplingStats) {
        *self.stats.lock() += stats;
    }

    pub fn sampling_stats(&self) -> SamplingStats {
        *self.stats.lock()
    }

    /// Sends the current statistics now, without waiting for a response.
    pub fn push_stats(&self) -> Result<(), ClientError> {
        let stats = *self.stats.lock();
        self.stream
            .engine()
            .send_fire_and_forget(SamplerToServer::Stats(stats))?;
        Ok(())
    }

    /// Stops the statistics push and reconnection, then closes the stream.
    pub async fn close(&self) -> Result<(), ClientError> {
        let stats_task = self.stats_task.lock().take();
        if let Some((cancel, task)) = stats_task {
            cancel.cancel();
            let _ = task.await;
        }
        self.stream.close().await
    }
}

async fn push_stats_periodically(
    handle: StreamHandle<SamplerToServer, ServerToSampler>,
    stats: Arc<Mutex<SamplingStats>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if handle.state() != StreamState::Registered {
            continue;
        }
        let snapshot = *stats.lock();
        if let Err(err) = handle.send_fire_and_forget(SamplerToServer::Stats(snapshot)) {
            debug!(error = %err, "statistics push skipped");
        }
    }
}
