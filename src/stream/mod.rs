//! Bidirectional request/response streams over a duplex transport.
//!
//! A stream runs a registration handshake and then a single dispatch loop per
//! connection. The loop sends queued requests, matches inbound responses to pending
//! requests in FIFO order, hands unsolicited pushes to a [`Handler`] and enforces
//! per-request response timeouts.
//!
//! * [`StreamEngine`] is the initiating (client/sampler) side. It is wrapped by a
//!   [`ReconnectSupervisor`] for automatic reconnection.
//! * [`ServerStream`] is the accepting side, created fresh per accepted connection.
//! * [`StreamHandle`] is the cloneable sending capability shared by both.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::{Envelope, Status};
use crate::transport::TransportError;

mod dispatch;
pub mod engine;
pub mod handle;
pub mod reconnect;
pub mod server;

pub use engine::StreamEngine;
pub use handle::StreamHandle;
pub use reconnect::{Backoff, ReconnectOptions, ReconnectSupervisor};
pub use server::ServerStream;

/// Registration state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Unknown,
    Unregistered,
    Registering,
    Registered,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Unknown => "Unknown",
            StreamState::Unregistered => "Unregistered",
            StreamState::Registering => "Registering",
            StreamState::Registered => "Registered",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("registration failure: {0}")]
    RegistrationFailure(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(#[from] TransportError),
    #[error("queue full")]
    QueueFull,
    #[error("response timeout after {0:?}")]
    ResponseTimeout(Duration),
    #[error("stream not registered")]
    NotRegistered,
    #[error("stream already connected")]
    AlreadyConnected,
    #[error("connection lost")]
    ConnectionLost,
    #[error("received a response with no pending request")]
    UnexpectedResponse,
    #[error("pending request cancelled")]
    Cancelled,
    #[error("stream closed")]
    Closed,
    #[error("close timed out")]
    CloseTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Timeouts and limits of one stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Upper bound for establishing the transport.
    pub conn_timeout: Duration,
    /// Upper bound for the peer to answer one request.
    pub response_timeout: Duration,
    /// Upper bound for the registration exchange.
    pub registration_timeout: Duration,
    /// Period of keep-alive frames; `None` disables them.
    pub keep_alive: Option<Duration>,
    /// Outbound queue depth. Sends fail with [`StreamError::QueueFull`] beyond it.
    pub queue_len: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            conn_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(10),
            keep_alive: Some(Duration::from_secs(10)),
            queue_len: 10,
        }
    }
}

impl StreamOptions {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len.max(1);
        self
    }

    pub fn with_keep_alive(mut self, period: Option<Duration>) -> Self {
        self.keep_alive = period;
        self
    }
}

/// What the dispatch loop should do with one inbound message.
#[derive(Debug)]
pub enum Dispatch<In, Out> {
    /// The message was an unsolicited push; send the optional reply.
    Handled(Option<Out>),
    /// The message answers the oldest pending request.
    Response(Envelope<In>),
}

/// Role-specific message handling shared by both stream sides.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Out: Send + 'static;
    type In: Send + 'static;

    /// Classifies and, for pushes, handles one inbound message.
    async fn handle(
        &self,
        msg: Envelope<Self::In>,
    ) -> Result<Dispatch<Self::In, Self::Out>, StreamError>;

    /// Observes every state transition of the stream.
    fn on_state_change(&self, _state: StreamState) {}
}

/// Initiating side of the registration handshake.
pub trait Registrant: Handler {
    fn registration_request(&self) -> Self::Out;

    fn check_registration_response(&self, msg: &Envelope<Self::In>) -> Result<(), StreamError>;
}

/// Accepting side of the registration handshake.
#[async_trait]
pub trait Registrar: Handler {
    /// Validates the peer's registration request. The returned status is sent back
    /// verbatim on rejection.
    async fn accept_registration(&self, msg: &Envelope<Self::In>) -> Result<(), Status>;

    fn registration_response(&self, status: Status) -> Self::Out;
}
