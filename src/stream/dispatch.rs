//! Per-connection dispatch loop shared by both stream sides.
use std::collections::VecDeque;
use std::future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::handle::{Outbound, Responder, SessionLink, StreamHandle};
use super::{Dispatch, Handler, StreamError, StreamOptions, StreamState};
use crate::messages::{Envelope, Frame};
use crate::transport::{Duplex, MessageSink, MessageSource, TransportError};

type Inbound<In> = Result<Envelope<In>, TransportError>;

struct Pending<In> {
    respond_to: Responder<In>,
    deadline: Instant,
}

/// Aborts the reader pump when the session ends.
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Forwards decoded inbound envelopes so a blocked read never stalls outbound sends.
fn spawn_pump<In: Send + 'static>(
    mut source: Box<dyn MessageSource<Frame<In>>>,
) -> (mpsc::Receiver<Inbound<In>>, PumpGuard) {
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(Some(Frame::Message(envelope))) => {
                    if tx.send(Ok(envelope)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(Frame::KeepAlive)) => {}
                Ok(None) => return,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    });
    (rx, PumpGuard(task))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Connection state owned by one running session.
pub(crate) struct Session<Out: Send + 'static, In: Send + 'static> {
    sink: Box<dyn MessageSink<Frame<Out>>>,
    inbound: mpsc::Receiver<Inbound<In>>,
    outbound: mpsc::Receiver<Outbound<Out, In>>,
    cancel: CancellationToken,
    _pump: PumpGuard,
}

impl<Out: Send + 'static, In: Send + 'static> Session<Out, In> {
    /// Starts the reader pump and attaches a fresh outbound queue to `handle`.
    pub(crate) fn attach(
        handle: &StreamHandle<Out, In>,
        duplex: Duplex<Frame<Out>, Frame<In>>,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (inbound, pump) = spawn_pump(duplex.source);
        let (tx, outbound) = mpsc::channel(options.queue_len.max(1));
        handle.attach(SessionLink {
            outbound: tx,
            cancel: cancel.clone(),
        });
        Self {
            sink: duplex.sink,
            inbound,
            outbound,
            cancel,
            _pump: pump,
        }
    }
}

/// Runs the dispatch loop until the session ends and returns why it ended.
///
/// # Behavior
/// * Queued requests are sent in order and enter the FIFO pending queue.
/// * Inbound messages go to the handler first; anything it does not claim answers
///   the oldest pending request.
/// * Once the outbound queue is closed and drained, the loop waits for the remaining
///   responses and ends with [`StreamError::Closed`].
/// * An expired response deadline, a response with nothing pending, a transport
///   error or cancellation ends the session.
/// * On exit every still-pending request fails with [`StreamError::ConnectionLost`]
///   and the stream returns to [`StreamState::Unregistered`].
pub(crate) async fn run<H: Handler>(
    handler: &Arc<H>,
    handle: &StreamHandle<H::Out, H::In>,
    mut session: Session<H::Out, H::In>,
    options: &StreamOptions,
) -> StreamError {
    let mut pending: VecDeque<Pending<H::In>> = VecDeque::new();
    let mut keep_alive = options.keep_alive.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let mut draining = false;
    let reason = loop {
        if draining && pending.is_empty() {
            break StreamError::Closed;
        }
        let deadline = pending.front().map(|p| p.deadline);
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break StreamError::Cancelled,
            _ = expire(deadline) => break StreamError::ResponseTimeout(options.response_timeout),
            // Outbound first: a peer flooding pushes must not starve queued requests.
            outbound = session.outbound.recv(), if !draining => {
                let (payload, respond_to) = match outbound {
                    Some(Outbound::Request { payload, respond_to }) => (payload, Some(respond_to)),
                    Some(Outbound::Notify(payload)) => (payload, None),
                    None => {
                        draining = true;
                        continue;
                    }
                };
                let frame = Frame::Message(Envelope::new(handle.uid(), payload));
                if let Err(err) = session.sink.send(frame).await {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Err(StreamError::ConnectionLost));
                    }
                    break StreamError::ConnectionFailure(err);
                }
                if let Some(respond_to) = respond_to {
                    pending.push_back(Pending {
                        respond_to,
                        deadline: Instant::now() + options.response_timeout,
                    });
                }
            }
            inbound = session.inbound.recv() => {
                let envelope = match inbound {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(err)) => break StreamError::ConnectionFailure(err),
                    None => break StreamError::ConnectionLost,
                };
                match handler.handle(envelope).await {
                    Ok(Dispatch::Handled(Some(reply))) => {
                        let frame = Frame::Message(Envelope::new(handle.uid(), reply));
                        if let Err(err) = session.sink.send(frame).await {
                            break StreamError::ConnectionFailure(err);
                        }
                    }
                    Ok(Dispatch::Handled(None)) => {}
                    Ok(Dispatch::Response(envelope)) => match pending.pop_front() {
                        Some(request) => {
                            let _ = request.respond_to.send(Ok(envelope));
                        }
                        None => break StreamError::UnexpectedResponse,
                    },
                    Err(err) => break err,
                }
            }
            _ = tick(&mut keep_alive) => {
                if let Err(err) = session.sink.send(Frame::KeepAlive).await {
                    break StreamError::ConnectionFailure(err);
                }
            }
        }
    };

    handle.detach();
    for request in pending.drain(..) {
        let _ = request.respond_to.send(Err(StreamError::ConnectionLost));
    }
    // Requests still queued but never sent.
    session.outbound.close();
    while let Ok(queued) = session.outbound.try_recv() {
        if let Outbound::Request { respond_to, .. } = queued {
            let _ = respond_to.send(Err(StreamError::ConnectionLost));
        }
    }

    handle.set_peer_uid(None);
    if handle.set_state(StreamState::Unregistered) {
        handler.on_state_change(StreamState::Unregistered);
    }
    reason
}
