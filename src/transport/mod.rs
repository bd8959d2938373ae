//! Duplex message transports underneath the stream engines.
//!
//! A transport is a pair of halves, a [`MessageSink`] and a [`MessageSource`], so the
//! reading half can be pumped from its own task while the dispatch loop writes.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time;

use crate::messages::Frame;

pub mod auth;
pub mod framed;
pub mod pipe;
pub mod tcp;
pub mod tls;

pub use pipe::{pipe, PipeConnector};
pub use tcp::{ConnectOptions, TcpConnector};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport closed")]
    Closed,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Writing half of a duplex transport.
#[async_trait]
pub trait MessageSink<M: Send + 'static>: Send {
    async fn send(&mut self, msg: M) -> Result<(), TransportError>;
}

/// Reading half of a duplex transport. `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait MessageSource<M: Send + 'static>: Send {
    async fn recv(&mut self) -> Result<Option<M>, TransportError>;
}

/// Both halves of one connection.
pub struct Duplex<O: Send + 'static, I: Send + 'static> {
    pub sink: Box<dyn MessageSink<O>>,
    pub source: Box<dyn MessageSource<I>>,
}

impl<O: Send + 'static, I: Send + 'static> Duplex<O, I> {
    pub fn new(sink: impl MessageSink<O> + 'static, source: impl MessageSource<I> + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl<O: Send + 'static, I: Send + 'static> std::fmt::Debug for Duplex<O, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

/// Opens new connections for a client-side stream engine.
#[async_trait]
pub trait Connector<Out: Send + 'static, In: Send + 'static>: Send + Sync {
    async fn connect(&self) -> Result<Duplex<Frame<Out>, Frame<In>>, TransportError>;
}

/// Receives one message, failing with [`TransportError::Timeout`] after `limit`.
pub async fn recv_within<M: Send + 'static>(
    source: &mut (dyn MessageSource<M> + '_),
    limit: Duration,
    what: &'static str,
) -> Result<Option<M>, TransportError> {
    match time::timeout(limit, source.recv()).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::Timeout(what)),
    }
}
