use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::control::SamplerConfig;
use crate::messages::{Envelope, SamplerRegisterReq, SamplerToServer, ServerToSampler, Status};
use crate::registry::{ConfigureError, Epoch, SamplerConn, SamplerIdentity, SamplerRegistry};
use crate::stream::{Dispatch, Handler, Registrar, StreamError, StreamHandle, StreamState};

/// Pushes configuration over one accepted `SamplerConn` stream.
pub struct StreamSamplerConn {
    handle: StreamHandle<ServerToSampler, SamplerToServer>,
}

impl StreamSamplerConn {
    pub fn new(handle: StreamHandle<ServerToSampler, SamplerToServer>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl SamplerConn for StreamSamplerConn {
    async fn configure(&self, config: SamplerConfig) -> Result<(), ConfigureError> {
        let response = self
            .handle
            .send_request(ServerToSampler::ConfigureReq(config))
            .await?;
        match response.payload {
            SamplerToServer::ConfigureRes(status) if status.is_ok() => Ok(()),
            SamplerToServer::ConfigureRes(status) => Err(ConfigureError::Rejected(status.describe())),
            other => Err(StreamError::Protocol(format!("unexpected configure response {other:?}")).into()),
        }
    }
}

struct Pending {
    uid: String,
    request: SamplerRegisterReq,
}

/// Server side of one `SamplerConn` stream.
pub struct SamplerHandler {
    registry: Arc<SamplerRegistry>,
    handle: StreamHandle<ServerToSampler, SamplerToServer>,
    pending: Mutex<Option<Pending>>,
    registered: Mutex<Option<(String, Epoch)>>,
}

impl SamplerHandler {
    pub fn new(
        registry: Arc<SamplerRegistry>,
        handle: StreamHandle<ServerToSampler, SamplerToServer>,
    ) -> Self {
        Self {
            registry,
            handle,
            pending: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    fn register(&self) {
        let Some(Pending { uid, request }) = self.pending.lock().take() else {
            return;
        };
        let identity = SamplerIdentity {
            uid: uid.clone(),
            resource: request.resource,
            name: request.name,
            tags: request.tags,
            capabilities: request.capabilities,
        };
        let conn = Arc::new(StreamSamplerConn::new(self.handle.clone()));
        let epoch = self
            .registry
            .register(identity, request.initial_config.as_ref(), conn);
        *self.registered.lock() = Some((uid, epoch));
    }

    fn deregister(&self) {
        if let Some((uid, epoch)) = self.registered.lock().take() {
            if self.registry.release(&uid, epoch) {
                debug!(sampler_uid = %uid, "sampler deregistered");
            }
        }
    }
}

#[async_trait]
impl Handler for SamplerHandler {
    type Out = ServerToSampler;
    type In = SamplerToServer;

    async fn handle(
        &self,
        msg: Envelope<SamplerToServer>,
    ) -> Result<Dispatch<SamplerToServer, ServerToSampler>, StreamError> {
        match msg.payload {
            SamplerToServer::ConfigureRes(_) => Ok(Dispatch::Response(msg)),
            SamplerToServer::Stats(stats) => {
                if let Err(err) = self.registry.update_stats(&msg.uid, stats) {
                    warn!(sampler_uid = %msg.uid, error = %err, "dropping sampler stats");
                }
                Ok(Dispatch::Handled(None))
            }
            SamplerToServer::RegisterReq(_) => {
                warn!(sampler_uid = %msg.uid, "ignoring registration on a registered stream");
                Ok(Dispatch::Handled(None))
            }
        }
    }

    fn on_state_change(&self, state: StreamState) {
        match state {
            StreamState::Registered => self.register(),
            StreamState::Unregistered => self.deregister(),
            _ => {}
        }
    }
}

#[async_trait]
impl Registrar for SamplerHandler {
    async fn accept_registration(&self, msg: &Envelope<SamplerToServer>) -> Result<(), Status> {
        let SamplerToServer::RegisterReq(request) = &msg.payload else {
            return Err(Status::unknown("first message must be a registration request"));
        };
        if let Some(update) = &request.initial_config {
            update
                .validate()
                .map_err(|err| Status::bad_request(err.to_string()))?;
        }
        *self.pending.lock() = Some(Pending {
            uid: msg.uid.clone(),
            request: request.clone(),
        });
        Ok(())
    }

    fn registration_response(&self, status: Status) -> ServerToSampler {
        ServerToSampler::RegisterRes(status)
    }
}
