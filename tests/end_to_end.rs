use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use controlplane::control::{Rule, SamplerConfig, SamplerConfigUpdate, Stream};
use controlplane::messages::{
    Envelope, Frame, SamplerToServer, ServerToSampler, StatusKind,
};
use controlplane::registry::StorageKind;
use controlplane::stream::{ReconnectOptions, StreamError, StreamState};
use controlplane::transport::tls::{TlsClientOptions, TlsServerOptions};
use controlplane::transport::{pipe, ConnectOptions, TransportError};
use controlplane::{
    Client, ClientError, ClientOptions, Sampler, SamplerEvent, SamplerOptions, Server,
    ServerOptions,
};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const TOKEN: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(10);

fn server_options() -> ServerOptions {
    controlplane::logging::init_for_tests();
    ServerOptions::default()
        .with_auth_bearer(TOKEN)
        .with_reconciliation_period(Duration::from_millis(200))
}

fn client_options(token: &str) -> ClientOptions {
    connect_with(ConnectOptions::default().with_bearer_token(token))
}

fn connect_with(connect: ConnectOptions) -> ClientOptions {
    ClientOptions::default()
        .with_connect(connect)
        .with_reconnect(ReconnectOptions {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(500),
            ..ReconnectOptions::default()
        })
}

fn sampler_options() -> SamplerOptions {
    SamplerOptions::default()
        .with_client(client_options(TOKEN))
        .with_stats_period(None)
}

fn upsert(uid: &str, name: &str, expression: &str) -> SamplerConfigUpdate {
    SamplerConfigUpdate::new().upsert_stream(Stream::new(uid, name, Rule::cel(expression)))
}

fn stream_count(config: &SamplerConfig) -> usize {
    config.streams.as_ref().map_or(0, |s| s.len())
}

async fn wait_for_streams(
    events: &mut broadcast::Receiver<SamplerEvent>,
    count: usize,
) -> SamplerConfig {
    timeout(WAIT, async {
        loop {
            if let SamplerEvent::ConfigUpdate(config) = events.recv().await.unwrap() {
                if stream_count(&config) == count {
                    return config;
                }
            }
        }
    })
    .await
    .expect("configuration not received")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_configuration_reaches_every_sampler_instance() {
    let server = Server::new("server-1", server_options()).unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let sampler = Sampler::tcp(&addr, "resource1", "sampler1", sampler_options()).unwrap();
    let mut events = sampler.events();
    sampler.connect().await.unwrap();
    assert_eq!(sampler.state(), StreamState::Registered);

    let client = Client::tcp(&addr, client_options(TOKEN)).unwrap();
    client.connect().await.unwrap();
    client
        .configure_sampler("resource1", "sampler1", Some(upsert("stream-1", "s1", "x > 1")))
        .await
        .unwrap();

    let config = wait_for_streams(&mut events, 1).await;
    assert_eq!(config.streams.unwrap()["stream-1"].rule.expression, "x > 1");

    // A second replica gets the current configuration on its first push.
    let replica = Sampler::tcp(&addr, "resource1", "sampler1", sampler_options()).unwrap();
    let mut replica_events = replica.events();
    replica.connect().await.unwrap();
    let first = timeout(WAIT, async {
        loop {
            if let SamplerEvent::ConfigUpdate(config) = replica_events.recv().await.unwrap() {
                return config;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stream_count(&first), 1);
    assert_eq!(server.get_samplers("resource1", "sampler1").len(), 2);

    let samplers = client.list_samplers().await.unwrap();
    assert_eq!(samplers.len(), 1);
    assert_eq!(samplers[0].resource, "resource1");
    assert_eq!(stream_count(&samplers[0].config), 1);

    replica.close().await.unwrap();
    eventually(|| server.get_samplers("resource1", "sampler1").len() == 1).await;

    client.close().await.unwrap();
    sampler.close().await.unwrap();
    server.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_configuration_resets_it() {
    let server = Server::new("server-1", server_options()).unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let sampler = Sampler::tcp(
        &addr,
        "resource1",
        "sampler1",
        sampler_options().with_initial_config(upsert("stream-1", "s1", "x > 1")),
    )
    .unwrap();
    let mut events = sampler.events();
    sampler.connect().await.unwrap();
    wait_for_streams(&mut events, 1).await;

    let client = Client::tcp(&addr, client_options(TOKEN)).unwrap();
    client.connect().await.unwrap();
    client.configure_sampler("resource1", "sampler1", None).await.unwrap();
    wait_for_streams(&mut events, 0).await;

    client.close().await.unwrap();
    sampler.close().await.unwrap();
    server.stop(WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configure_errors_carry_their_status() {
    let server = Server::new("server-1", server_options()).unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let samplers: Vec<_> = [("resource1", "sampler1"), ("resource2", "sampler1")]
        .into_iter()
        .map(|(resource, name)| Sampler::tcp(&addr, resource, name, sampler_options()).unwrap())
        .collect();
    for sampler in &samplers {
        sampler.connect().await.unwrap();
    }

    let client = Client::tcp(&addr, client_options(TOKEN)).unwrap();
    client.connect().await.unwrap();

    let status_of = |res: Result<(), ClientError>| match res {
        Err(ClientError::Rejected(status)) => status.kind,
        other => panic!("expected a rejection, got {other:?}"),
    };

    let ambiguous = client
        .configure_sampler("*", "sampler1", Some(upsert("a", "a", "x > 1")))
        .await;
    assert_eq!(status_of(ambiguous), StatusKind::Error);

    let missing = client
        .configure_sampler("*", "sampler9", Some(upsert("a", "a", "x > 1")))
        .await;
    assert_eq!(status_of(missing), StatusKind::Error);

    let invalid = client
        .configure_sampler("resource1", "sampler1", Some(upsert("a", "not a name!", "x > 1")))
        .await;
    assert_eq!(status_of(invalid), StatusKind::BadRequest);

    client
        .configure_sampler("resource2", "*", Some(upsert("a", "a", "x > 1")))
        .await
        .unwrap();
    client
        .configure_sampler_by_uid(samplers[0].uid(), Some(upsert("b", "b", "x > 2")))
        .await
        .unwrap();

    client.close().await.unwrap();
    for sampler in &samplers {
        sampler.close().await.unwrap();
    }
    server.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected() {
    let server = Server::new("server-1", server_options()).unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let client = Client::tcp(&addr, client_options("wrong")).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Stream(StreamError::ConnectionFailure(TransportError::Unauthenticated(_)))
        ),
        "unexpected error {err:?}"
    );
    assert!(server.client_registry().clients().is_empty());
    server.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn first_message_must_be_a_registration() {
    let server = Arc::new(Server::new("server-1", ServerOptions::default()).unwrap());
    let (mut sampler_end, server_end) =
        pipe::<Frame<SamplerToServer>, Frame<ServerToSampler>>();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_sampler(server_end).await })
    };

    sampler_end
        .sink
        .send(Frame::Message(Envelope::new(
            "sampler-x",
            SamplerToServer::Stats(Default::default()),
        )))
        .await
        .unwrap();
    match sampler_end.source.recv().await.unwrap().unwrap() {
        Frame::Message(Envelope {
            payload: ServerToSampler::RegisterRes(status),
            ..
        }) => assert_eq!(status.kind, StatusKind::Unknown),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(matches!(
        serving.await.unwrap(),
        Err(StreamError::RegistrationFailure(_))
    ));
    assert!(server.sampler_registry().get_registered_instances().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn samplers_recover_after_a_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let options = || server_options().with_storage(StorageKind::Disk(dir.path().to_path_buf()));

    let server = Server::new("server-1", options()).unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let sampler = Sampler::tcp(&addr, "resource1", "sampler1", sampler_options()).unwrap();
    let mut events = sampler.events();
    sampler.connect().await.unwrap();

    let client = Client::tcp(&addr, client_options(TOKEN)).unwrap();
    client.connect().await.unwrap();
    client
        .configure_sampler("resource1", "sampler1", Some(upsert("stream-1", "s1", "x > 1")))
        .await
        .unwrap();
    wait_for_streams(&mut events, 1).await;
    client.close().await.unwrap();

    server.stop(WAIT).await.unwrap();
    eventually(|| sampler.state() != StreamState::Registered).await;

    let restarted = Server::new("server-2", options()).unwrap();
    restarted.start(&addr).await.unwrap();

    // The configuration is reloaded from disk and pushed again after re-registration.
    wait_for_streams(&mut events, 1).await;
    assert_eq!(sampler.state(), StreamState::Registered);
    assert_eq!(restarted.get_samplers("resource1", "sampler1").len(), 1);

    sampler.close().await.unwrap();
    restarted.stop(WAIT).await.unwrap();
}

/// CA plus a server certificate for `localhost` signed by it, as PEM files.
struct Pki {
    _dir: TempDir,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

fn pki() -> Pki {
    let dir = tempfile::tempdir().unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_cert = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let write = |name: &str, pem: String| {
        let path = dir.path().join(name);
        std::fs::write(&path, pem).unwrap();
        path
    };
    Pki {
        ca: write("ca.pem", ca_cert.pem()),
        cert: write("server.pem", server_cert.pem()),
        key: write("server.key", server_key.serialize_pem()),
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configuration_flows_over_tls() {
    let pki = pki();
    let server = Server::new(
        "server-1",
        server_options().with_tls(TlsServerOptions {
            cert_path: pki.cert.clone(),
            key_path: pki.key.clone(),
        }),
    )
    .unwrap();
    let addr = server.start("127.0.0.1:0").await.unwrap().to_string();

    let tls = ConnectOptions::default()
        .with_bearer_token(TOKEN)
        .with_tls(TlsClientOptions {
            ca_path: Some(pki.ca.clone()),
            server_name: Some("localhost".into()),
        });

    let sampler = Sampler::tcp(
        &addr,
        "resource1",
        "sampler1",
        sampler_options().with_client(connect_with(tls.clone())),
    )
    .unwrap();
    let mut events = sampler.events();
    sampler.connect().await.unwrap();
    assert_eq!(sampler.state(), StreamState::Registered);

    let client = Client::tcp(&addr, connect_with(tls)).unwrap();
    client.connect().await.unwrap();
    client
        .configure_sampler("resource1", "sampler1", Some(upsert("stream-1", "s1", "x > 1")))
        .await
        .unwrap();
    let config = wait_for_streams(&mut events, 1).await;
    assert_eq!(config.streams.unwrap()["stream-1"].rule.expression, "x > 1");

    // Plaintext peers never get past the handshake.
    let plain = Client::tcp(&addr, client_options(TOKEN)).unwrap();
    assert!(plain.connect().await.is_err());
    assert_eq!(server.client_registry().clients().len(), 1);

    client.close().await.unwrap();
    sampler.close().await.unwrap();
    server.stop(WAIT).await.unwrap();
}
