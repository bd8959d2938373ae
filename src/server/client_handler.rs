use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::messages::{
    ClientToServer, ConfigureSamplerReq, Envelope, SamplerTarget, ServerToClient, Status,
};
use crate::registry::{ClientRegistry, Epoch, RegistryError, SamplerRegistry};
use crate::stream::{Dispatch, Handler, Registrar, StreamError, StreamState};

/// Server side of one `ClientConn` stream.
pub struct ClientHandler {
    clients: Arc<ClientRegistry>,
    samplers: Arc<SamplerRegistry>,
    peer: Mutex<Option<String>>,
    epoch: Mutex<Option<Epoch>>,
}

impl ClientHandler {
    pub fn new(clients: Arc<ClientRegistry>, samplers: Arc<SamplerRegistry>) -> Self {
        Self {
            clients,
            samplers,
            peer: Mutex::new(None),
            epoch: Mutex::new(None),
        }
    }

    fn configure_sampler(&self, req: ConfigureSamplerReq) -> Status {
        let key = match &req.target {
            SamplerTarget::Uid(uid) => self.samplers.resolve_uid(uid),
            SamplerTarget::Name { resource, name } => self.samplers.resolve(resource, name),
        };
        let key = match key {
            Ok(key) => key,
            Err(err) => return registry_status(err),
        };

        let res = match &req.update {
            Some(update) => {
                if let Err(err) = update.validate() {
                    return Status::bad_request(err.to_string());
                }
                self.samplers
                    .update_sampler_config(&key.resource, &key.name, update)
            }
            None => self.samplers.delete_sampler_config(&key.resource, &key.name),
        };
        match res {
            Ok(()) => {
                info!(sampler = %key, deleted = req.update.is_none(), "sampler configuration changed");
                Status::ok()
            }
            Err(err) => registry_status(err),
        }
    }
}

fn registry_status(err: RegistryError) -> Status {
    Status::error(err.to_string())
}

#[async_trait]
impl Handler for ClientHandler {
    type Out = ServerToClient;
    type In = ClientToServer;

    async fn handle(
        &self,
        msg: Envelope<ClientToServer>,
    ) -> Result<Dispatch<ClientToServer, ServerToClient>, StreamError> {
        let reply = match msg.payload {
            ClientToServer::ListSamplersReq => ServerToClient::ListSamplersRes {
                status: Status::ok(),
                samplers: self.samplers.samplers(),
            },
            ClientToServer::ConfigureSamplerReq(req) => {
                ServerToClient::ConfigureSamplerRes(self.configure_sampler(req))
            }
            ClientToServer::RegisterReq => {
                warn!(client_uid = %msg.uid, "ignoring registration on a registered stream");
                return Ok(Dispatch::Handled(None));
            }
        };
        Ok(Dispatch::Handled(Some(reply)))
    }

    fn on_state_change(&self, state: StreamState) {
        let Some(uid) = self.peer.lock().clone() else {
            return;
        };
        match state {
            StreamState::Registered => {
                *self.epoch.lock() = Some(self.clients.register(&uid));
            }
            StreamState::Unregistered => {
                if let Some(epoch) = self.epoch.lock().take() {
                    if self.clients.release(&uid, epoch) {
                        debug!(client_uid = %uid, "client deregistered");
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Registrar for ClientHandler {
    async fn accept_registration(&self, msg: &Envelope<ClientToServer>) -> Result<(), Status> {
        match msg.payload {
            ClientToServer::RegisterReq => {
                *self.peer.lock() = Some(msg.uid.clone());
                Ok(())
            }
            _ => Err(Status::unknown("first message must be a registration request")),
        }
    }

    fn registration_response(&self, status: Status) -> ServerToClient {
        ServerToClient::RegisterRes(status)
    }
}
