use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::dispatch::{self, Session};
use super::handle::StreamHandle;
use super::{Registrant, StreamError, StreamOptions, StreamState};
use crate::messages::{Envelope, Frame};
use crate::transport::{recv_within, Connector, Duplex, TransportError};

/// Initiating side of a stream: connects, registers and runs one session at a time.
///
/// # Guarantees
/// * `connect` is synchronous from the caller's point of view: it returns only once
///   the stream is [`StreamState::Registered`] or the attempt failed.
/// * Only one handshake is in flight; connecting an active stream fails with
///   [`StreamError::AlreadyConnected`].
/// * The session itself runs on a background task; its end is observable through
///   [`StreamEngine::state_changes`].
pub struct StreamEngine<H: Registrant> {
    handle: StreamHandle<H::Out, H::In>,
    handler: Arc<H>,
    connector: Arc<dyn Connector<H::Out, H::In>>,
    options: StreamOptions,
    connecting: AtomicBool,
    closing: AtomicBool,
    task: Mutex<Option<JoinHandle<StreamError>>>,
}

impl<H: Registrant> StreamEngine<H> {
    pub fn new(
        uid: impl Into<String>,
        handler: Arc<H>,
        connector: Arc<dyn Connector<H::Out, H::In>>,
        options: StreamOptions,
    ) -> Self {
        Self {
            handle: StreamHandle::new(uid),
            handler,
            connector,
            options,
            connecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn uid(&self) -> &str {
        self.handle.uid()
    }

    pub fn handle(&self) -> StreamHandle<H::Out, H::In> {
        self.handle.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.handle.state_changes()
    }

    /// UID the server announced during registration.
    pub fn server_uid(&self) -> Option<String> {
        self.handle.peer_uid()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub async fn send_request(&self, payload: H::Out) -> Result<Envelope<H::In>, StreamError> {
        self.handle.send_request(payload).await
    }

    pub fn send_fire_and_forget(&self, payload: H::Out) -> Result<(), StreamError> {
        self.handle.send_fire_and_forget(payload)
    }

    /// Opens a connection, performs the registration handshake and starts the session.
    ///
    /// # Errors
    /// * [`StreamError::AlreadyConnected`] when a session is active or being set up.
    /// * [`StreamError::ConnectionFailure`] when the transport cannot be opened.
    /// * [`StreamError::RegistrationFailure`] when the handshake is rejected or times out.
    pub async fn connect(&self) -> Result<(), StreamError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyConnected);
        }
        let res = self.connect_inner().await;
        self.connecting.store(false, Ordering::SeqCst);
        res
    }

    async fn connect_inner(&self) -> Result<(), StreamError> {
        if matches!(
            self.state(),
            StreamState::Registering | StreamState::Registered
        ) {
            return Err(StreamError::AlreadyConnected);
        }
        self.closing.store(false, Ordering::SeqCst);

        let mut duplex = match time::timeout(self.options.conn_timeout, self.connector.connect()).await {
            Ok(res) => res?,
            Err(_) => return Err(TransportError::Timeout("connect").into()),
        };

        self.transition(StreamState::Registering);
        let server_uid = match self.register(&mut duplex).await {
            Ok(uid) => uid,
            Err(err) => {
                self.transition(StreamState::Unregistered);
                return Err(err);
            }
        };
        self.handle.set_peer_uid(Some(server_uid.clone()));

        let cancel = CancellationToken::new();
        let session = Session::attach(&self.handle, duplex, &self.options, cancel);
        self.transition(StreamState::Registered);
        info!(uid = %self.uid(), server_uid = %server_uid, "stream registered");

        let handler = self.handler.clone();
        let handle = self.handle.clone();
        let options = self.options.clone();
        let span = info_span!("stream", uid = %self.uid());
        let task = tokio::spawn(
            async move {
                let reason = dispatch::run(&handler, &handle, session, &options).await;
                match &reason {
                    StreamError::Closed => debug!("stream closed"),
                    other => warn!(error = %other, "stream session ended"),
                }
                reason
            }
            .instrument(span),
        );
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn register(
        &self,
        duplex: &mut Duplex<Frame<H::Out>, Frame<H::In>>,
    ) -> Result<String, StreamError> {
        let request = Envelope::new(self.uid(), self.handler.registration_request());
        duplex
            .sink
            .send(Frame::Message(request))
            .await
            .map_err(|e| StreamError::RegistrationFailure(e.to_string()))?;

        loop {
            let frame = recv_within(
                duplex.source.as_mut(),
                self.options.registration_timeout,
                "registration",
            )
            .await
            .map_err(|e| StreamError::RegistrationFailure(e.to_string()))?;
            match frame {
                Some(Frame::Message(response)) => {
                    self.handler.check_registration_response(&response)?;
                    return Ok(response.uid);
                }
                Some(Frame::KeepAlive) => continue,
                None => {
                    return Err(StreamError::RegistrationFailure(
                        "connection closed during registration".into(),
                    ))
                }
            }
        }
    }

    fn transition(&self, state: StreamState) {
        if self.handle.set_state(state) {
            self.handler.on_state_change(state);
        }
    }

    /// Stops accepting new messages, flushes the queue and waits for the session to end.
    ///
    /// # Errors
    /// Returns [`StreamError::CloseTimeout`] if the session did not finish within
    /// `timeout`; it is then cancelled.
    pub async fn close(&self, timeout: Duration) -> Result<(), StreamError> {
        self.closing.store(true, Ordering::SeqCst);
        let cancel = self.handle.detach();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return Ok(());
        };

        match time::timeout(timeout, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                task.abort();
                self.handle.set_peer_uid(None);
                self.transition(StreamState::Unregistered);
                Err(StreamError::CloseTimeout)
            }
        }
    }
}

impl<H: Registrant> Drop for StreamEngine<H> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
