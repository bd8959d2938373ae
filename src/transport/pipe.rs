//! In-memory transport used to wire engines together without sockets.
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Duplex, MessageSink, MessageSource, TransportError};
use crate::messages::Frame;

const PIPE_DEPTH: usize = 16;

#[derive(Debug)]
pub struct PipeSink<M> {
    sender: mpsc::Sender<M>,
}

#[derive(Debug)]
pub struct PipeSource<M> {
    receiver: mpsc::Receiver<M>,
}

#[async_trait]
impl<M: Send + 'static> MessageSink<M> for PipeSink<M> {
    async fn send(&mut self, msg: M) -> Result<(), TransportError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl<M: Send + 'static> MessageSource<M> for PipeSource<M> {
    async fn recv(&mut self) -> Result<Option<M>, TransportError> {
        Ok(self.receiver.recv().await)
    }
}

/// Builds two connected duplex ends: what one side sends, the other receives.
pub fn pipe<A: Send + 'static, B: Send + 'static>() -> (Duplex<A, B>, Duplex<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(PIPE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(PIPE_DEPTH);
    (
        Duplex::new(PipeSink { sender: a_tx }, PipeSource { receiver: b_rx }),
        Duplex::new(PipeSink { sender: b_tx }, PipeSource { receiver: a_rx }),
    )
}

/// Connector that hands the far end of each new pipe to an acceptor channel.
pub struct PipeConnector<Out: Send + 'static, In: Send + 'static> {
    accepted: mpsc::UnboundedSender<Duplex<Frame<In>, Frame<Out>>>,
}

impl<Out: Send + 'static, In: Send + 'static> PipeConnector<Out, In> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Duplex<Frame<In>, Frame<Out>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { accepted: tx }, rx)
    }
}

#[async_trait]
impl<Out: Send + 'static, In: Send + 'static> Connector<Out, In> for PipeConnector<Out, In> {
    async fn connect(&self) -> Result<Duplex<Frame<Out>, Frame<In>>, TransportError> {
        let (ours, theirs) = pipe();
        self.accepted
            .send(theirs)
            .map_err(|_| TransportError::Io("connection refused".into()))?;
        Ok(ours)
    }
}
