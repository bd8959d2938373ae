use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use controlplane::messages::{Envelope, Frame};
use controlplane::stream::{
    Dispatch, Handler, ReconnectOptions, ReconnectSupervisor, Registrant, StreamEngine,
    StreamError, StreamOptions, StreamState,
};
use controlplane::transport::{Duplex, PipeConnector};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
enum Up {
    Register,
    Echo(u32),
    Note(u32),
}

#[derive(Debug, Clone, PartialEq)]
enum Down {
    Registered(bool),
    Echo(u32),
    Notice(u32),
}

struct TestClient {
    notices: mpsc::UnboundedSender<u32>,
}

#[async_trait]
impl Handler for TestClient {
    type Out = Up;
    type In = Down;

    async fn handle(&self, msg: Envelope<Down>) -> Result<Dispatch<Down, Up>, StreamError> {
        match msg.payload {
            Down::Notice(n) => {
                let _ = self.notices.send(n);
                Ok(Dispatch::Handled(None))
            }
            _ => Ok(Dispatch::Response(msg)),
        }
    }
}

impl Registrant for TestClient {
    fn registration_request(&self) -> Up {
        Up::Register
    }

    fn check_registration_response(&self, msg: &Envelope<Down>) -> Result<(), StreamError> {
        match msg.payload {
            Down::Registered(true) => Ok(()),
            _ => Err(StreamError::RegistrationFailure("rejected".into())),
        }
    }
}

type Peer = Duplex<Frame<Down>, Frame<Up>>;
type Accepted = mpsc::UnboundedReceiver<Peer>;

fn options() -> StreamOptions {
    StreamOptions::default().with_keep_alive(None)
}

fn engine(
    options: StreamOptions,
) -> (Arc<StreamEngine<TestClient>>, Accepted, mpsc::UnboundedReceiver<u32>) {
    let (connector, accepted) = PipeConnector::<Up, Down>::new();
    let (notices, notices_rx) = mpsc::unbounded_channel();
    let engine = StreamEngine::new(
        "client-1",
        Arc::new(TestClient { notices }),
        Arc::new(connector),
        options,
    );
    (Arc::new(engine), accepted, notices_rx)
}

async fn next_message(peer: &mut Peer) -> Option<Envelope<Up>> {
    loop {
        match peer.source.recv().await.ok()?? {
            Frame::Message(envelope) => return Some(envelope),
            Frame::KeepAlive => continue,
        }
    }
}

async fn reply(peer: &mut Peer, payload: Down) {
    peer.sink
        .send(Frame::Message(Envelope::new("server", payload)))
        .await
        .unwrap();
}

/// Accepts the next connection and answers its registration.
async fn accept(accepted: &mut Accepted, ok: bool) -> Peer {
    let mut peer = accepted.recv().await.unwrap();
    let register = next_message(&mut peer).await.unwrap();
    assert_eq!(register.payload, Up::Register);
    assert_eq!(register.uid, "client-1");
    reply(&mut peer, Down::Registered(ok)).await;
    peer
}

async fn connected(options: StreamOptions) -> (Arc<StreamEngine<TestClient>>, Peer, Accepted) {
    let (engine, mut accepted, _) = engine(options);
    let connecting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect().await })
    };
    let peer = accept(&mut accepted, true).await;
    connecting.await.unwrap().unwrap();
    (engine, peer, accepted)
}

async fn wait_for_state(engine: &StreamEngine<TestClient>, state: StreamState) {
    let mut changes = engine.state_changes();
    timeout(Duration::from_secs(30), changes.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test]
async fn registration_sets_server_uid_and_state() {
    let (engine, _peer, _accepted) = connected(options()).await;
    assert_eq!(engine.state(), StreamState::Registered);
    assert_eq!(engine.server_uid().as_deref(), Some("server"));
}

#[tokio::test]
async fn sends_before_registration_are_refused() {
    let (engine, _accepted, _) = engine(options());
    assert_eq!(engine.send_fire_and_forget(Up::Note(1)), Err(StreamError::NotRegistered));
    assert_eq!(
        engine.send_request(Up::Echo(1)).await,
        Err(StreamError::NotRegistered)
    );
}

#[tokio::test]
async fn rejected_registration_fails_connect() {
    let (engine, mut accepted, _) = engine(options());
    let connecting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect().await })
    };
    let _peer = accept(&mut accepted, false).await;
    assert!(matches!(
        connecting.await.unwrap(),
        Err(StreamError::RegistrationFailure(_))
    ));
    assert_eq!(engine.state(), StreamState::Unregistered);
}

#[tokio::test(start_paused = true)]
async fn registration_times_out() {
    let (engine, mut accepted, _) = engine(options().with_registration_timeout(Duration::from_secs(1)));
    let connecting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect().await })
    };
    let _silent_peer = accepted.recv().await.unwrap();
    assert!(matches!(
        connecting.await.unwrap(),
        Err(StreamError::RegistrationFailure(_))
    ));
    assert_eq!(engine.state(), StreamState::Unregistered);
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let (engine, _peer, _accepted) = connected(options()).await;
    assert_eq!(engine.connect().await, Err(StreamError::AlreadyConnected));
}

#[tokio::test]
async fn responses_follow_request_order() {
    let (engine, mut peer, _accepted) = connected(options()).await;

    let server = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 5 {
            let request = next_message(&mut peer).await.unwrap();
            let Up::Echo(n) = request.payload else {
                panic!("unexpected {:?}", request.payload);
            };
            seen.push(n);
        }
        for n in &seen {
            reply(&mut peer, Down::Echo(n * 10)).await;
        }
        (seen, peer)
    });

    let requests = (0..5).map(|n| engine.send_request(Up::Echo(n)));
    let responses = join_all(requests).await;
    let (seen, _peer) = server.await.unwrap();

    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    for (n, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap().payload, Down::Echo(n as u32 * 10));
    }
}

#[tokio::test]
async fn full_queue_fails_immediately() {
    let (engine, _peer, _accepted) = connected(options().with_queue_len(2)).await;
    // No await between sends, so the dispatch loop cannot drain the queue.
    assert!(engine.send_fire_and_forget(Up::Note(1)).is_ok());
    assert!(engine.send_fire_and_forget(Up::Note(2)).is_ok());
    assert_eq!(engine.send_fire_and_forget(Up::Note(3)), Err(StreamError::QueueFull));
}

#[tokio::test(start_paused = true)]
async fn response_timeout_tears_the_connection_down() {
    let (engine, mut peer, _accepted) =
        connected(options().with_response_timeout(Duration::from_millis(200))).await;

    let silent = tokio::spawn(async move {
        let _ = next_message(&mut peer).await;
        peer
    });
    assert_eq!(
        engine.send_request(Up::Echo(1)).await,
        Err(StreamError::ConnectionLost)
    );
    wait_for_state(&engine, StreamState::Unregistered).await;
    assert!(engine.server_uid().is_none());
    drop(silent);
}

#[tokio::test]
async fn unsolicited_pushes_reach_the_handler() {
    let (engine, mut accepted, mut notices) = engine(options());
    let connecting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect().await })
    };
    let mut peer = accept(&mut accepted, true).await;
    connecting.await.unwrap().unwrap();

    reply(&mut peer, Down::Notice(7)).await;
    assert_eq!(notices.recv().await, Some(7));
    assert_eq!(engine.state(), StreamState::Registered);
}

#[tokio::test]
async fn response_without_request_is_fatal() {
    let (engine, mut peer, _accepted) = connected(options()).await;
    reply(&mut peer, Down::Echo(1)).await;
    wait_for_state(&engine, StreamState::Unregistered).await;
}

#[tokio::test(start_paused = true)]
async fn dropping_a_pending_request_resets_the_connection() {
    let (engine, mut peer, _accepted) = connected(options()).await;
    let abandoned = timeout(Duration::from_millis(50), engine.send_request(Up::Echo(1))).await;
    assert!(abandoned.is_err());
    wait_for_state(&engine, StreamState::Unregistered).await;
    assert_eq!(next_message(&mut peer).await.map(|m| m.payload), Some(Up::Echo(1)));
}

#[tokio::test]
async fn close_flushes_queued_messages() {
    let (engine, mut peer, _accepted) = connected(options()).await;
    for n in 0..3 {
        engine.send_fire_and_forget(Up::Note(n)).unwrap();
    }
    engine.close(Duration::from_secs(5)).await.unwrap();
    assert!(engine.is_closing());
    assert_eq!(engine.state(), StreamState::Unregistered);

    let mut received = Vec::new();
    while let Some(message) = next_message(&mut peer).await {
        received.push(message.payload);
    }
    assert_eq!(received, vec![Up::Note(0), Up::Note(1), Up::Note(2)]);
}

#[tokio::test]
async fn peer_disconnect_fails_pending_requests() {
    let (engine, mut peer, _accepted) = connected(options()).await;
    let closer = tokio::spawn(async move {
        let _ = next_message(&mut peer).await;
        drop(peer);
    });
    assert_eq!(
        engine.send_request(Up::Echo(9)).await,
        Err(StreamError::ConnectionLost)
    );
    closer.await.unwrap();
    wait_for_state(&engine, StreamState::Unregistered).await;
}

#[tokio::test(start_paused = true)]
async fn supervisor_reconnects_after_connection_loss() {
    let (engine, peer, mut accepted) = connected(options()).await;
    let supervisor = ReconnectSupervisor::spawn(
        engine.clone(),
        ReconnectOptions {
            initial_interval: Duration::from_millis(100),
            ..ReconnectOptions::default()
        },
    );

    drop(peer);
    wait_for_state(&engine, StreamState::Unregistered).await;

    // First retry is refused, the second one succeeds.
    let refused = accepted.recv().await.unwrap();
    drop(refused);
    let _peer = accept(&mut accepted, true).await;
    wait_for_state(&engine, StreamState::Registered).await;

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn supervisor_stays_idle_after_close() {
    let (engine, _peer, mut accepted) = connected(options()).await;
    let supervisor = ReconnectSupervisor::spawn(engine.clone(), ReconnectOptions::default());

    engine.close(Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(accepted.try_recv().is_err());
    assert_eq!(engine.state(), StreamState::Unregistered);
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_only_after_a_long_session() {
    let (engine, mut peer, mut accepted) = connected(options()).await;
    let supervisor = ReconnectSupervisor::spawn(
        engine.clone(),
        ReconnectOptions {
            randomization: 0.0,
            ..ReconnectOptions::default()
        },
    );

    let mut gaps = Vec::new();
    for held in [0, 0, 0, 61] {
        tokio::time::sleep(Duration::from_secs(held)).await;
        let dropped_at = tokio::time::Instant::now();
        drop(peer);
        peer = accept(&mut accepted, true).await;
        gaps.push(dropped_at.elapsed());
        wait_for_state(&engine, StreamState::Registered).await;
    }

    let ms = |millis| Duration::from_millis(millis);
    assert!(gaps[0] >= ms(500) && gaps[0] < ms(750), "{gaps:?}");
    assert!(gaps[1] >= ms(750) && gaps[1] < ms(1125), "{gaps:?}");
    assert!(gaps[2] >= ms(1125) && gaps[2] < ms(1500), "{gaps:?}");
    // Held past min_stream_duration, so the next delay starts over.
    assert!(gaps[3] >= ms(500) && gaps[3] < ms(750), "{gaps:?}");

    supervisor.stop().await;
}

#[tokio::test]
async fn requests_go_out_while_the_peer_floods_pushes() {
    let (engine, mut accepted, _notices) = engine(options());
    let connecting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.connect().await })
    };
    let Duplex { mut sink, mut source } = accept(&mut accepted, true).await;
    connecting.await.unwrap().unwrap();

    let flood = tokio::spawn(async move {
        for n in 0.. {
            let push = Frame::Message(Envelope::new("server", Down::Notice(n)));
            if sink.send(push).await.is_err() {
                break;
            }
        }
    });
    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_request(Up::Echo(1)).await })
    };

    let sent = timeout(Duration::from_secs(10), async {
        loop {
            match source.recv().await.unwrap() {
                Some(Frame::Message(envelope)) => return envelope.payload,
                Some(Frame::KeepAlive) => continue,
                None => panic!("stream closed"),
            }
        }
    })
    .await
    .expect("request starved by inbound pushes");
    assert_eq!(sent, Up::Echo(1));

    flood.abort();
    request.abort();
}
