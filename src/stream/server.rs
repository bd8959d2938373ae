use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::{self, Session};
use super::handle::StreamHandle;
use super::{Registrar, StreamError, StreamOptions, StreamState};
use crate::messages::{Envelope, Frame, Status};
use crate::transport::{recv_within, Duplex};

/// Accepting side of a stream, created per accepted connection.
///
/// The peer must open with its registration request within the registration timeout;
/// after a successful reply the stream serves requests until the connection ends.
pub struct ServerStream<H: Registrar> {
    handle: StreamHandle<H::Out, H::In>,
    handler: Arc<H>,
    options: StreamOptions,
}

impl<H: Registrar> ServerStream<H> {
    /// `handle` must be the handle the handler was built with, so that requests the
    /// handler issues travel on this connection.
    pub fn new(handle: StreamHandle<H::Out, H::In>, handler: Arc<H>, options: StreamOptions) -> Self {
        Self {
            handle,
            handler,
            options,
        }
    }

    pub fn handle(&self) -> StreamHandle<H::Out, H::In> {
        self.handle.clone()
    }

    fn transition(&self, state: StreamState) {
        if self.handle.set_state(state) {
            self.handler.on_state_change(state);
        }
    }

    /// Runs the registration exchange and then the session to completion.
    ///
    /// # Errors
    /// [`StreamError::RegistrationFailure`] if the first message is missing, late or
    /// rejected; otherwise the reason the session ended, except that a peer closing
    /// the connection or `shutdown` firing are reported as success.
    pub async fn serve(
        self,
        mut duplex: Duplex<Frame<H::Out>, Frame<H::In>>,
        shutdown: CancellationToken,
    ) -> Result<(), StreamError> {
        self.transition(StreamState::Registering);
        let request = match self.await_registration(&mut duplex).await {
            Ok(request) => request,
            Err(err) => {
                self.transition(StreamState::Unregistered);
                return Err(err);
            }
        };

        if let Err(status) = self.handler.accept_registration(&request).await {
            warn!(peer_uid = %request.uid, status = %status.describe(), "registration rejected");
            let reply = Envelope::new(self.handle.uid(), self.handler.registration_response(status.clone()));
            let _ = duplex.sink.send(Frame::Message(reply)).await;
            self.transition(StreamState::Unregistered);
            return Err(StreamError::RegistrationFailure(status.describe()));
        }

        let reply = Envelope::new(self.handle.uid(), self.handler.registration_response(Status::ok()));
        if let Err(err) = duplex.sink.send(Frame::Message(reply)).await {
            self.transition(StreamState::Unregistered);
            return Err(StreamError::RegistrationFailure(err.to_string()));
        }

        self.handle.set_peer_uid(Some(request.uid.clone()));
        let session = Session::attach(&self.handle, duplex, &self.options, shutdown.child_token());
        self.transition(StreamState::Registered);
        info!(peer_uid = %request.uid, "peer registered");

        match dispatch::run(&self.handler, &self.handle, session, &self.options).await {
            StreamError::ConnectionLost | StreamError::Closed | StreamError::Cancelled => {
                debug!(peer_uid = %request.uid, "peer stream ended");
                Ok(())
            }
            err => Err(err),
        }
    }

    async fn await_registration(
        &self,
        duplex: &mut Duplex<Frame<H::Out>, Frame<H::In>>,
    ) -> Result<Envelope<H::In>, StreamError> {
        loop {
            let frame = recv_within(
                duplex.source.as_mut(),
                self.options.registration_timeout,
                "registration request",
            )
            .await
            .map_err(|e| StreamError::RegistrationFailure(e.to_string()))?;
            match frame {
                Some(Frame::Message(envelope)) => return Ok(envelope),
                Some(Frame::KeepAlive) => continue,
                None => {
                    return Err(StreamError::RegistrationFailure(
                        "connection closed before registration".into(),
                    ))
                }
            }
        }
    }
}
