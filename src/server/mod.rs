//! Control plane server: accepts client and sampler streams, keeps the registries
//! and runs the reconciliation loop.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::control::SamplerSummary;
use crate::messages::{
    ClientToServer, Endpoint, Frame, SamplerToServer, ServerToClient, ServerToSampler,
};
use crate::registry::{
    dirty_channel, ClientRegistry, EventStream, RegistryError, SamplerRegistry, StorageError,
};
use crate::stream::{ServerStream, StreamError, StreamHandle};
use crate::transport::{auth, framed, tls, Duplex, TransportError};

pub mod client_handler;
pub mod options;
pub mod reconcile;
pub mod sampler_handler;

pub use client_handler::ClientHandler;
pub use options::ServerOptions;
pub use reconcile::ReconciliationLoop;
pub use sampler_handler::{SamplerHandler, StreamSamplerConn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server already started")]
    AlreadyStarted,
    #[error("server stopped")]
    Stopped,
    #[error("stop timed out")]
    StopTimeout,
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Transport(err.into())
    }
}

struct Shared {
    uid: String,
    options: ServerOptions,
    clients: Arc<ClientRegistry>,
    samplers: Arc<SamplerRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Shared {
    async fn serve_client(
        &self,
        duplex: Duplex<Frame<ServerToClient>, Frame<ClientToServer>>,
    ) -> Result<(), StreamError> {
        let handle = StreamHandle::new(self.uid.clone());
        let handler = Arc::new(ClientHandler::new(self.clients.clone(), self.samplers.clone()));
        ServerStream::new(handle, handler, self.options.stream.clone())
            .serve(duplex, self.shutdown.clone())
            .await
    }

    async fn serve_sampler(
        &self,
        duplex: Duplex<Frame<ServerToSampler>, Frame<SamplerToServer>>,
    ) -> Result<(), StreamError> {
        let handle = StreamHandle::new(self.uid.clone());
        let handler = Arc::new(SamplerHandler::new(self.samplers.clone(), handle.clone()));
        ServerStream::new(handle, handler, self.options.stream.clone())
            .serve(duplex, self.shutdown.clone())
            .await
    }

    /// Runs the preamble on a fresh byte stream and serves the endpoint it selects.
    async fn serve_connection<S>(&self, io: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut source) = framed::split(io, self.options.max_frame_len);
        let endpoint = auth::server_hello(
            &mut sink,
            &mut source,
            self.options.auth_bearer.as_deref(),
            self.options.preamble_timeout,
        )
        .await?;
        let res = match endpoint {
            Endpoint::Client => self.serve_client(Duplex::new(sink, source)).await,
            Endpoint::Sampler => self.serve_sampler(Duplex::new(sink, source)).await,
        };
        if let Err(err) = res {
            debug!(?endpoint, error = %err, "stream ended with error");
        }
        Ok(())
    }

    async fn accept_tcp(&self, stream: TcpStream, tls: Option<TlsAcceptor>) -> Result<(), ServerError> {
        stream.set_nodelay(true)?;
        match tls {
            Some(acceptor) => {
                let stream = match time::timeout(self.options.preamble_timeout, acceptor.accept(stream)).await {
                    Ok(res) => res.map_err(|e| TransportError::Tls(e.to_string()))?,
                    Err(_) => return Err(TransportError::Timeout("tls handshake").into()),
                };
                self.serve_connection(stream).await
            }
            None => self.serve_connection(stream).await,
        }
    }
}

/// Control plane server.
///
/// # Guarantees
/// * Every accepted connection gets its own stream and handler wired to the shared
///   registries; registration and deregistration follow the stream state.
/// * Dirty sampler instances are reconciled on every notification and at least once
///   per reconciliation period.
/// * `stop` cancels every connection and background loop and closes event streams.
pub struct Server {
    shared: Arc<Shared>,
    dirty: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Server {
    /// Builds the storage backend, loads persisted samplers and wires the dirty channel.
    pub fn new(uid: impl Into<String>, options: ServerOptions) -> Result<Self, ServerError> {
        let storage = options.storage.build()?;
        let (notifier, dirty) = dirty_channel();
        let samplers = Arc::new(SamplerRegistry::new(storage, notifier));
        samplers.load()?;

        Ok(Self {
            shared: Arc::new(Shared {
                uid: uid.into(),
                options,
                clients: Arc::new(ClientRegistry::new()),
                samplers,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            dirty: Mutex::new(Some(dirty)),
        })
    }

    pub fn uid(&self) -> &str {
        &self.shared.uid
    }

    pub fn client_registry(&self) -> &Arc<ClientRegistry> {
        &self.shared.clients
    }

    pub fn sampler_registry(&self) -> &Arc<SamplerRegistry> {
        &self.shared.samplers
    }

    /// Binds `addr`, then spawns the accept loop and the reconciliation loop.
    /// Returns the bound address.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, ServerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ServerError::Stopped);
        }
        let tls = self
            .shared
            .options
            .tls
            .as_ref()
            .map(tls::server_acceptor)
            .transpose()?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.start_reconciliation()?;

        let shared = self.shared.clone();
        self.shared
            .tasks
            .spawn(accept_loop(shared, listener, tls).instrument(info_span!("server", addr = %local)));
        info!(addr = %local, tls = self.shared.options.tls.is_some(), "control plane listening");
        Ok(local)
    }

    /// Spawns the reconciliation loop alone, for servers fed through
    /// [`Server::serve_client`] and [`Server::serve_sampler`].
    pub fn start_reconciliation(&self) -> Result<(), ServerError> {
        let dirty = self.dirty.lock().take().ok_or(ServerError::AlreadyStarted)?;
        let reconciler = ReconciliationLoop::new(
            self.shared.samplers.clone(),
            self.shared.options.reconciliation_period,
        );
        self.shared.tasks.spawn(
            reconciler
                .run(dirty, self.shared.shutdown.clone())
                .instrument(info_span!("reconcile")),
        );
        Ok(())
    }

    /// Serves one `ClientConn` stream over `duplex` until it ends.
    pub async fn serve_client(
        &self,
        duplex: Duplex<Frame<ServerToClient>, Frame<ClientToServer>>,
    ) -> Result<(), StreamError> {
        self.shared.serve_client(duplex).await
    }

    /// Serves one `SamplerConn` stream over `duplex` until it ends.
    pub async fn serve_sampler(
        &self,
        duplex: Duplex<Frame<ServerToSampler>, Frame<SamplerToServer>>,
    ) -> Result<(), StreamError> {
        self.shared.serve_sampler(duplex).await
    }

    /// One view per registered instance of `(resource, name)`.
    pub fn get_samplers(&self, resource: &str, name: &str) -> Vec<SamplerSummary> {
        self.shared.samplers.instances(resource, name)
    }

    pub fn events(&self) -> EventStream {
        self.shared.samplers.events()
    }

    /// Counts samples collected for `(resource, name)` outside the sampler itself.
    pub fn update_sampler_stats(
        &self,
        resource: &str,
        name: &str,
        collected_samples: u64,
    ) -> Result<(), ServerError> {
        Ok(self
            .shared
            .samplers
            .update_sampler_stats(resource, name, collected_samples)?)
    }

    /// Cancels every connection and background loop, then waits up to `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        self.shared.shutdown.cancel();
        self.shared.samplers.close_events();
        self.shared.tasks.close();
        time::timeout(timeout, self.shared.tasks.wait())
            .await
            .map_err(|_| ServerError::StopTimeout)?;
        info!(uid = %self.shared.uid, "control plane stopped");
        Ok(())
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let conn = shared.clone();
        let tls = tls.clone();
        shared.tasks.spawn(
            async move {
                if let Err(err) = conn.accept_tcp(stream, tls).await {
                    warn!(error = %err, "connection rejected");
                }
            }
            .instrument(info_span!("conn", %peer)),
        );
    }
    debug!("accept loop stopped");
}
