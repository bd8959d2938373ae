use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::{ClientError, ClientOptions, Supervised};
use crate::control::{SamplerConfigUpdate, SamplerSummary};
use crate::messages::{
    ClientToServer, ConfigureSamplerReq, Endpoint, Envelope, SamplerTarget, ServerToClient,
};
use crate::stream::{Dispatch, Handler, Registrant, StreamEngine, StreamError, StreamState};
use crate::transport::{Connector, TcpConnector};

/// Client side of the `ClientConn` protocol. Every server message answers a request.
pub struct ClientProtocol;

#[async_trait]
impl Handler for ClientProtocol {
    type Out = ClientToServer;
    type In = ServerToClient;

    async fn handle(
        &self,
        msg: Envelope<ServerToClient>,
    ) -> Result<Dispatch<ServerToClient, ClientToServer>, StreamError> {
        Ok(Dispatch::Response(msg))
    }
}

impl Registrant for ClientProtocol {
    fn registration_request(&self) -> ClientToServer {
        ClientToServer::RegisterReq
    }

    fn check_registration_response(&self, msg: &Envelope<ServerToClient>) -> Result<(), StreamError> {
        match &msg.payload {
            ServerToClient::RegisterRes(status) if status.is_ok() => Ok(()),
            ServerToClient::RegisterRes(status) => {
                Err(StreamError::RegistrationFailure(status.describe()))
            }
            other => Err(StreamError::RegistrationFailure(format!(
                "unexpected registration response {other:?}"
            ))),
        }
    }
}

/// Operator-side connection: lists samplers and changes their configuration.
///
/// # Guarantees
/// * [`Client::connect`] returns only once registered, or with the first failure.
/// * After that, lost connections are re-established in the background; requests
///   made while disconnected fail with [`StreamError::NotRegistered`].
pub struct Client {
    uid: String,
    stream: Supervised<ClientProtocol>,
}

impl Client {
    pub fn new(
        connector: Arc<dyn Connector<ClientToServer, ServerToClient>>,
        options: ClientOptions,
    ) -> Self {
        let uid = Uuid::new_v4().to_string();
        let engine = StreamEngine::new(
            uid.clone(),
            Arc::new(ClientProtocol),
            connector,
            options.stream.clone(),
        );
        Self {
            uid,
            stream: Supervised::new(engine, &options),
        }
    }

    /// Client talking to a server at `addr` over TCP.
    pub fn tcp(addr: impl Into<String>, options: ClientOptions) -> Result<Self, ClientError> {
        let connector = TcpConnector::new(addr, Endpoint::Client, options.connect.clone())?;
        Ok(Self::new(Arc::new(connector), options))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.stream.connect().await
    }

    pub fn state(&self) -> StreamState {
        self.stream.engine().state()
    }

    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.stream.engine().state_changes()
    }

    /// Every logical sampler known to the server, with aggregated statistics.
    pub async fn list_samplers(&self) -> Result<Vec<SamplerSummary>, ClientError> {
        let response = self
            .stream
            .engine()
            .send_request(ClientToServer::ListSamplersReq)
            .await?;
        match response.payload {
            ServerToClient::ListSamplersRes { status, samplers } if status.is_ok() => Ok(samplers),
            ServerToClient::ListSamplersRes { status, .. } => Err(ClientError::Rejected(status)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Applies `update` to the sampler named `(resource, name)`; `None` deletes its
    /// configuration. Either part may be `*` as long as exactly one sampler matches.
    pub async fn configure_sampler(
        &self,
        resource: &str,
        name: &str,
        update: Option<SamplerConfigUpdate>,
    ) -> Result<(), ClientError> {
        self.configure(
            SamplerTarget::Name {
                resource: resource.to_string(),
                name: name.to_string(),
            },
            update,
        )
        .await
    }

    /// Applies `update` to the logical sampler owning instance `uid`.
    pub async fn configure_sampler_by_uid(
        &self,
        uid: &str,
        update: Option<SamplerConfigUpdate>,
    ) -> Result<(), ClientError> {
        self.configure(SamplerTarget::Uid(uid.to_string()), update).await
    }

    async fn configure(
        &self,
        target: SamplerTarget,
        update: Option<SamplerConfigUpdate>,
    ) -> Result<(), ClientError> {
        let request = ClientToServer::ConfigureSamplerReq(ConfigureSamplerReq { target, update });
        let response = self.stream.engine().send_request(request).await?;
        match response.payload {
            ServerToClient::ConfigureSamplerRes(status) if status.is_ok() => Ok(()),
            ServerToClient::ConfigureSamplerRes(status) => Err(ClientError::Rejected(status)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Stops reconnecting, flushes queued requests and closes the stream.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.stream.close().await
    }
}
