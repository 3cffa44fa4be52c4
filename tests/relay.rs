mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RelayBuilder, fake_intake, names, pod, sized_pod};
use futures::future::BoxFuture;
use k8s_resync_relay::proto::resync_relay_client::ResyncRelayClient;
use k8s_resync_relay::proto::{ResourceRecord, SubmitRequest};
use k8s_resync_relay::wire::ResyncBatchFrame;
use k8s_resync_relay::{
    CredentialError, CredentialProvider, CredentialRefresher, Credentials, FrameKind,
    IngestionServer, PipelineConfig, RelayConfig,
};
use prost::Message;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::transport::Server;

/// Paused-clock timers fire on millisecond ticks.
fn assert_near(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(5),
        "elapsed {elapsed:?}, expected {expected:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn order_survives_reconnect() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new().start(Arc::clone(&connector));

    // The first session dies before anything is sent on it.
    let first = intake.accept().await;
    drop(first);

    for name in ["i1", "i2", "i3"] {
        relay.submit(pod(name)).await;
    }

    let mut second = intake.accept().await;
    let mut delivered = Vec::new();
    while delivered.len() < 3 {
        delivered.extend(names(&second.next_batch().await));
    }
    assert_eq!(delivered, ["i1", "i2", "i3"]);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn batches_keep_order_across_sessions() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new().start(Arc::clone(&connector));

    let mut first = intake.accept().await;
    relay.submit(pod("a")).await;
    assert_eq!(names(&first.next_batch().await), ["a"]);

    drop(first);
    relay.submit(pod("b")).await;
    relay.submit(pod("c")).await;

    let mut second = intake.accept().await;
    assert_eq!(names(&second.next_batch().await), ["b", "c"]);
    assert_eq!(connector.attempts(), 2);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_first_after_long_outage() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .pipeline(|p| p.heartbeat_interval = Duration::from_secs(1))
        .start(Arc::clone(&connector));

    let first = intake.accept().await;
    connector.refuse(true);
    drop(first);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(connector.attempts() > 2);
    connector.refuse(false);

    let mut second = intake.accept().await;
    let frame = second.next_frame().await.expect("frame after reconnect");
    assert_eq!(frame.kind(), FrameKind::Heartbeat);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn idle_session_gets_heartbeats() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .pipeline(|p| p.heartbeat_interval = Duration::from_secs(2))
        .start(connector);

    let mut session = intake.accept().await;
    let started = Instant::now();
    for beat in 1..=2 {
        let frame = session.next_frame().await.unwrap();
        assert_eq!(frame.kind(), FrameKind::Heartbeat);
        assert_near(started.elapsed(), Duration::from_secs(2 * beat));
    }

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn single_item_flushes_at_max_latency() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .config(|c| c.batch.max_latency = Duration::from_secs(5))
        .start(connector);

    let mut session = intake.accept().await;
    let started = Instant::now();
    relay.submit(pod("only")).await;

    let batch = session.next_batch().await;
    assert_eq!(names(&batch), ["only"]);
    assert_near(started.elapsed(), Duration::from_secs(5));

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_without_waiting() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .config(|c| {
            c.batch.max_items = 3;
            c.batch.max_latency = Duration::from_secs(60);
        })
        .start(connector);

    let mut session = intake.accept().await;
    let started = Instant::now();
    for name in ["a", "b", "c", "d"] {
        relay.submit(pod(name)).await;
    }

    assert_eq!(names(&session.next_batch().await), ["a", "b", "c"]);
    assert!(started.elapsed() < Duration::from_secs(1));

    // The fourth item waits for its own latency trigger.
    assert_eq!(names(&session.next_batch().await), ["d"]);
    assert!(started.elapsed() >= Duration::from_secs(60));

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn batch_carries_host_metadata() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new().start(connector);

    let mut session = intake.accept().await;
    assert_eq!(session.agent_id, "agent-test");
    relay.submit(pod("a")).await;

    let batch = session.next_batch().await;
    let metadata = batch.metadata.expect("metadata attached");
    assert_eq!(metadata.agent_id, "agent-test");
    assert_eq!(metadata.hostname, "node-test");
    assert_eq!(batch.items[0].uid, "uid-a");

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refreshed_token_used_on_next_session() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new().start(Arc::clone(&connector));

    let first = intake.accept().await;
    assert_eq!(first.token, "token-1");

    relay.config_tx.send_modify(|config| {
        *config = Arc::new(config.with_credentials("intake.test:443", "token-2"));
    });
    drop(first);

    let second = intake.accept().await;
    assert_eq!(second.token, "token-2");

    relay.stop().await;
}

struct FixedToken(&'static str);

impl CredentialProvider for FixedToken {
    fn fetch(&self) -> BoxFuture<'_, Result<Credentials, CredentialError>> {
        let credentials = Credentials {
            endpoint: "intake.test:443".to_string(),
            token: self.0.to_string(),
        };
        Box::pin(async move { Ok(credentials) })
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_token_triggers_refresh() {
    let (connector, mut intake) = fake_intake();
    let (config_tx, config_rx) =
        watch::channel(Arc::new(PipelineConfig::new("intake.test:443", "stale")));
    let refresher = CredentialRefresher::new(
        Arc::new(FixedToken("fresh")),
        config_tx.clone(),
        Duration::from_secs(3600),
    );
    let relay = RelayBuilder::new()
        .refresh_hint(refresher.nudge())
        .start_with(Arc::clone(&connector), config_tx, config_rx);
    let refresh_task = tokio::spawn(refresher.run());

    assert_eq!(intake.reject().await, "stale");
    let session = intake.accept().await;
    assert_eq!(session.token, "fresh");

    refresh_task.abort();
    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_open_batch() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .config(|c| c.batch.max_latency = Duration::from_secs(60))
        .start(connector);

    let mut session = intake.accept().await;
    relay.submit(pod("late")).await;

    let stopping = tokio::spawn(relay.stop());
    assert_eq!(names(&session.next_batch().await), ["late"]);
    stopping.await.unwrap();
    assert!(session.next_frame().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn item_at_size_limit_keeps_its_neighbours() {
    let config = RelayConfig::testing();
    let max_bytes = config.batch.max_bytes;
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .pipeline(|p| p.write_buffer_bytes = 2 * max_bytes)
        .start(connector);

    let mut session = intake.accept().await;
    relay.submit(sized_pod("a", max_bytes - 96)).await;
    relay.submit(sized_pod("b", max_bytes)).await;
    relay.submit(pod("c")).await;

    let mut delivered = Vec::new();
    while delivered.len() < 3 {
        delivered.extend(names(&session.next_batch().await));
    }
    assert_eq!(delivered, ["a", "b", "c"]);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shrunk_buffer_cap_splits_batches_after_refresh() {
    let (connector, mut intake) = fake_intake();
    let relay = RelayBuilder::new()
        .config(|c| {
            c.batch.max_items = 3;
            c.batch.max_latency = Duration::from_secs(60);
        })
        .start(Arc::clone(&connector));

    let first = intake.accept().await;
    relay.config_tx.send_modify(|config| {
        let mut smaller = (**config).clone();
        smaller.write_buffer_bytes = 2500;
        *config = Arc::new(smaller);
    });
    drop(first);

    let mut second = intake.accept().await;
    for name in ["a", "b", "c"] {
        relay.submit(sized_pod(name, 1000)).await;
    }

    let mut delivered = Vec::new();
    let mut batches = 0;
    while delivered.len() < 3 {
        let frame = second.next_frame().await.expect("relay sends a batch");
        if frame.kind() != FrameKind::ResyncBatch {
            continue;
        }
        assert!(frame.len() <= 2500, "frame of {} bytes", frame.len());
        let batch = ResyncBatchFrame::decode(frame.payload()).unwrap();
        delivered.extend(names(&batch));
        batches += 1;
    }
    assert_eq!(delivered, ["a", "b", "c"]);
    assert!(batches >= 2);

    relay.stop().await;
}

fn request(kind: &str, names: &[&str]) -> SubmitRequest {
    SubmitRequest {
        kind: kind.to_string(),
        records: names
            .iter()
            .map(|name| ResourceRecord {
                namespace: "default".to_string(),
                name: (*name).to_string(),
                uid: format!("uid-{name}"),
                resource_version: "7".to_string(),
                payload: Vec::new(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn grpc_submissions_reach_the_backend() {
    let (connector, mut intake) = fake_intake();
    let config = RelayConfig::testing();
    let relay = RelayBuilder::new().start(connector);
    let mut session = intake.accept().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(
        Server::builder()
            .add_service(IngestionServer::new(relay.queue.clone(), &config).into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = server_stopped.await;
            }),
    );

    let mut client = ResyncRelayClient::connect(format!("http://{addr}")).await.unwrap();

    let status = client
        .submit(request("Pod", &["bad", ""]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client.submit(request("Secret", &["x"])).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let accepted = client.submit(request("Pod", &["good"])).await.unwrap();
    assert_eq!(accepted.into_inner().accepted, 1);

    let accepted = client
        .collect(tokio_stream::iter(vec![
            request("Pod", &["s1", "s2"]),
            request("Pod", &["s3"]),
        ]))
        .await
        .unwrap();
    assert_eq!(accepted.into_inner().accepted, 3);

    let mut delivered = Vec::new();
    while delivered.len() < 4 {
        delivered.extend(names(&session.next_batch().await));
    }
    assert_eq!(delivered, ["good", "s1", "s2", "s3"]);

    let _ = stop_server.send(());
    server.await.unwrap().unwrap();
    relay.stop().await;
}
