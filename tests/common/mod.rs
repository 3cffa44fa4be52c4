//! Shared fixtures: an in-memory intake backend and a relay launcher.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use k8s_resync_relay::channel::BoxedTransport;
use k8s_resync_relay::wire::{self, AuthenticateFrame, ResyncBatchFrame};
use k8s_resync_relay::{
    Connector, DeliveryChannel, Frame, FrameKind, HostMetadata, PipelineConfig, RelayConfig,
    ResourceKind, ResyncItem, ResyncProcessor, ResyncQueue, resync_queue,
};
use prost::Message;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Connector handing out in-memory sessions to a [`FakeIntake`].
pub struct ScriptedConnector {
    attempts: AtomicUsize,
    refusing: AtomicBool,
    sessions: mpsc::UnboundedSender<DuplexStream>,
}

impl ScriptedConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// While set, every attempt fails with `ConnectionRefused`.
    pub fn refuse(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, _config: &'a PipelineConfig) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refusing.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (client, server) = duplex(1024 * 1024);
            self.sessions
                .send(server)
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

/// The backend end of the scripted connector.
pub struct FakeIntake {
    sessions: mpsc::UnboundedReceiver<DuplexStream>,
}

pub fn fake_intake() -> (Arc<ScriptedConnector>, FakeIntake) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = ScriptedConnector {
        attempts: AtomicUsize::new(0),
        refusing: AtomicBool::new(false),
        sessions: tx,
    };
    (Arc::new(connector), FakeIntake { sessions: rx })
}

impl FakeIntake {
    /// Waits for the next session and accepts its token.
    pub async fn accept(&mut self) -> IntakeSession {
        self.handshake(true).await
    }

    /// Waits for the next session and rejects its token; returns the token.
    pub async fn reject(&mut self) -> String {
        self.handshake(false).await.token
    }

    async fn handshake(&mut self, accepted: bool) -> IntakeSession {
        let mut stream = self.sessions.recv().await.expect("relay connects");
        let frame = wire::read_frame(&mut stream, wire::MAX_INBOUND_FRAME)
            .await
            .unwrap()
            .expect("authenticate frame");
        assert_eq!(frame.kind(), FrameKind::Authenticate);
        let auth = AuthenticateFrame::decode(frame.payload()).unwrap();

        use tokio::io::AsyncWriteExt;
        stream
            .write_all(Frame::auth_ack(accepted, "token expired").as_bytes())
            .await
            .unwrap();

        IntakeSession {
            stream,
            token: auth.token,
            agent_id: auth.agent_id,
        }
    }
}

/// One accepted session, as seen by the backend.
pub struct IntakeSession {
    stream: DuplexStream,
    pub token: String,
    pub agent_id: String,
}

impl IntakeSession {
    /// Next frame, or `None` once the relay hangs up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        wire::read_frame(&mut self.stream, wire::MAX_INBOUND_FRAME)
            .await
            .unwrap()
    }

    /// Next batch, skipping heartbeats.
    pub async fn next_batch(&mut self) -> ResyncBatchFrame {
        loop {
            let frame = self.next_frame().await.expect("relay sends a batch");
            if frame.kind() == FrameKind::ResyncBatch {
                return ResyncBatchFrame::decode(frame.payload()).unwrap();
            }
        }
    }
}

/// Item names of a batch, in order.
pub fn names(batch: &ResyncBatchFrame) -> Vec<String> {
    batch.items.iter().map(|item| item.name.clone()).collect()
}

pub fn pod(name: &str) -> ResyncItem {
    sized_pod(name, 0)
}

/// A pod whose payload is `bytes` long.
pub fn sized_pod(name: &str, bytes: usize) -> ResyncItem {
    ResyncItem::new(
        ResourceKind::Pod,
        "default",
        name,
        format!("uid-{name}"),
        "1",
        vec![b'x'; bytes],
    )
}

/// A processor running on its own task.
pub struct Relay {
    pub queue: ResyncQueue,
    pub config_tx: watch::Sender<Arc<PipelineConfig>>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct RelayBuilder {
    config: RelayConfig,
    pipeline: PipelineConfig,
    refresh_hint: Option<Arc<Notify>>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::testing(),
            pipeline: PipelineConfig::new("intake.test:443", "token-1"),
            refresh_hint: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut RelayConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn pipeline(mut self, f: impl FnOnce(&mut PipelineConfig)) -> Self {
        f(&mut self.pipeline);
        self
    }

    pub fn refresh_hint(mut self, hint: Arc<Notify>) -> Self {
        self.refresh_hint = Some(hint);
        self
    }

    /// Starts with a fresh config watch.
    pub fn start(self, connector: Arc<ScriptedConnector>) -> Relay {
        let (config_tx, config_rx) = watch::channel(Arc::new(self.pipeline.clone()));
        self.start_with(connector, config_tx, config_rx)
    }

    /// Starts on a caller-provided config watch.
    pub fn start_with(
        self,
        connector: Arc<ScriptedConnector>,
        config_tx: watch::Sender<Arc<PipelineConfig>>,
        config_rx: watch::Receiver<Arc<PipelineConfig>>,
    ) -> Relay {
        let mut channel = DeliveryChannel::new(
            connector,
            config_rx,
            self.config.channel.clone(),
            "agent-test",
            "node-test",
        );
        if let Some(hint) = self.refresh_hint {
            channel = channel.with_refresh_hint(hint);
        }

        let (queue, drain) = resync_queue(self.config.queue_capacity);
        let processor = ResyncProcessor::new(
            channel,
            drain,
            &self.config,
            HostMetadata::placeholder("agent-test", "node-test"),
        );

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(processor.run(async move {
            let _ = stop_rx.await;
        }));

        Relay {
            queue,
            config_tx,
            stop,
            task,
        }
    }
}

impl Relay {
    pub async fn submit(&self, item: ResyncItem) {
        self.queue
            .submit(item, std::time::Duration::from_secs(1))
            .await
            .expect("queue has room");
    }

    /// Signals shutdown and waits for the processor to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.expect("processor task");
    }
}
