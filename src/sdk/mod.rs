//! High-level client and sampler built on the stream engine.
//!
//! Both connect synchronously once, then keep the stream alive in the background
//! with a [`ReconnectSupervisor`]; only the first `connect` reports failures.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::messages::Status;
use crate::stream::{
    ReconnectOptions, ReconnectSupervisor, Registrant, StreamEngine, StreamError, StreamOptions,
};
use crate::transport::{ConnectOptions, TransportError};

pub mod client;
pub mod sampler;

pub use client::Client;
pub use sampler::{Sampler, SamplerEvent, SamplerOptions};

/// Errors returned by the SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// The transport could not be set up.
    Transport(TransportError),
    /// The stream failed or refused the request.
    Stream(StreamError),
    /// The server answered with a non-ok status.
    Rejected(Status),
    /// The server answered with a message of the wrong kind.
    UnexpectedResponse(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(err) => write!(f, "transport error: {}", err),
            ClientError::Stream(err) => write!(f, "stream error: {}", err),
            ClientError::Rejected(status) => write!(f, "rejected by server: {}", status.describe()),
            ClientError::UnexpectedResponse(what) => write!(f, "unexpected response: {}", what),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err)
    }
}

impl From<StreamError> for ClientError {
    fn from(err: StreamError) -> Self {
        ClientError::Stream(err)
    }
}

/// Connection settings shared by [`Client`] and [`Sampler`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect: ConnectOptions,
    pub stream: StreamOptions,
    pub reconnect: ReconnectOptions,
    /// Upper bound for `close` to flush queued messages.
    pub close_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            stream: StreamOptions::default(),
            reconnect: ReconnectOptions::default(),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientOptions {
    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_stream(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// A stream engine plus the supervisor that reconnects it.
pub(crate) struct Supervised<H: Registrant> {
    engine: Arc<StreamEngine<H>>,
    reconnect: ReconnectOptions,
    close_timeout: Duration,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
}

impl<H: Registrant> Supervised<H> {
    pub(crate) fn new(engine: StreamEngine<H>, options: &ClientOptions) -> Self {
        Self {
            engine: Arc::new(engine),
            reconnect: options.reconnect.clone(),
            close_timeout: options.close_timeout,
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<StreamEngine<H>> {
        &self.engine
    }

    pub(crate) async fn connect(&self) -> Result<(), ClientError> {
        if self.supervisor.lock().is_some() {
            return Err(StreamError::AlreadyConnected.into());
        }
        self.engine.connect().await?;
        let supervisor = ReconnectSupervisor::spawn(self.engine.clone(), self.reconnect.clone());
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<(), ClientError> {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.engine.close(self.close_timeout).await?;
        Ok(())
    }
}
