use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{StreamError, StreamState};
use crate::messages::Envelope;

pub(crate) type Responder<In> = oneshot::Sender<Result<Envelope<In>, StreamError>>;

/// One entry of the outbound queue.
pub(crate) enum Outbound<Out, In> {
    Request { payload: Out, respond_to: Responder<In> },
    Notify(Out),
}

/// Live connection state reachable from senders.
pub(crate) struct SessionLink<Out, In> {
    pub outbound: mpsc::Sender<Outbound<Out, In>>,
    pub cancel: CancellationToken,
}

struct Inner<Out, In> {
    uid: String,
    state: watch::Sender<StreamState>,
    link: Mutex<Option<SessionLink<Out, In>>>,
    peer_uid: Mutex<Option<String>>,
}

/// Cloneable sending side of a stream.
///
/// # Guarantees
/// * Sends never block: a full outbound queue fails immediately with
///   [`StreamError::QueueFull`].
/// * Sends are refused unless the stream is [`StreamState::Registered`].
/// * A response is delivered only to the request it answers (FIFO per connection).
pub struct StreamHandle<Out, In> {
    inner: Arc<Inner<Out, In>>,
}

impl<Out, In> Clone for StreamHandle<Out, In> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Out: Send + 'static, In: Send + 'static> std::fmt::Debug for StreamHandle<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("uid", &self.inner.uid)
            .field("state", &self.state())
            .finish()
    }
}

/// Tears the connection down if a request future is dropped before its response.
struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

impl<Out: Send + 'static, In: Send + 'static> StreamHandle<Out, In> {
    pub fn new(uid: impl Into<String>) -> Self {
        let (state, _) = watch::channel(StreamState::Unregistered);
        Self {
            inner: Arc::new(Inner {
                uid: uid.into(),
                state,
                link: Mutex::new(None),
                peer_uid: Mutex::new(None),
            }),
        }
    }

    /// UID this side announces in every envelope.
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// UID of the peer learned during registration.
    pub fn peer_uid(&self) -> Option<String> {
        self.inner.peer_uid.lock().clone()
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    /// Subscribes to state transitions. Intermediate states may be coalesced for slow
    /// observers; the latest state is always visible.
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    /// Queues a request and waits for its response.
    ///
    /// # Errors
    /// [`StreamError::NotRegistered`] or [`StreamError::QueueFull`] synchronously;
    /// [`StreamError::ConnectionLost`] if the session ends before the response.
    ///
    /// Dropping the returned future before it completes tears the connection down,
    /// since the peer's answer can no longer be matched.
    pub async fn send_request(&self, payload: Out) -> Result<Envelope<In>, StreamError> {
        let (tx, rx) = oneshot::channel();
        let cancel = self.enqueue(Outbound::Request {
            payload,
            respond_to: tx,
        })?;
        let guard = CancelOnDrop {
            token: Some(cancel),
        };
        let res = rx.await;
        guard.disarm();
        res.unwrap_or(Err(StreamError::ConnectionLost))
    }

    /// Queues a message that expects no response.
    pub fn send_fire_and_forget(&self, payload: Out) -> Result<(), StreamError> {
        self.enqueue(Outbound::Notify(payload)).map(|_| ())
    }

    fn enqueue(&self, msg: Outbound<Out, In>) -> Result<CancellationToken, StreamError> {
        if self.state() != StreamState::Registered {
            return Err(StreamError::NotRegistered);
        }
        let link = self.inner.link.lock();
        let link = link.as_ref().ok_or(StreamError::NotRegistered)?;
        link.outbound.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => StreamError::QueueFull,
            TrySendError::Closed(_) => StreamError::ConnectionLost,
        })?;
        Ok(link.cancel.clone())
    }

    pub(crate) fn attach(&self, link: SessionLink<Out, In>) {
        *self.inner.link.lock() = Some(link);
    }

    /// Drops the outbound sender so the session drains its queue and ends.
    pub(crate) fn detach(&self) -> Option<CancellationToken> {
        self.inner.link.lock().take().map(|link| link.cancel)
    }

    pub(crate) fn set_peer_uid(&self, uid: Option<String>) {
        *self.inner.peer_uid.lock() = uid;
    }

    /// Returns false if `state` was already current.
    pub(crate) fn set_state(&self, state: StreamState) -> bool {
        self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_shows_uid_and_state() {
        let handle = StreamHandle::<u32, u32>::new("server-1");
        let shown = format!("{handle:?}");
        assert!(shown.contains("server-1"));
        assert!(shown.contains("Unregistered"));
    }

    #[test]
    fn unattached_handle_refuses_sends() {
        let handle = StreamHandle::<u32, u32>::new("server-1");
        assert_eq!(handle.send_fire_and_forget(1), Err(StreamError::NotRegistered));
    }
}
