#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

//! Relay that forwards Kubernetes resync snapshots to a telemetry intake.
//!
//! Watchers running in the cluster submit object snapshots over gRPC. The
//! relay validates them, holds them in a bounded queue and ships them in
//! batches over a single long-lived, authenticated session to the intake
//! backend. The session reconnects forever; nothing accepted is dropped on
//! a transient disconnect.
//!
//! ```text
//!  watchers ──gRPC──► IngestionServer ──► ResyncQueue ──► ResyncProcessor ──► DeliveryChannel ──► intake
//!                     (tonic tasks)       (bounded)       (one driver task, owns both) ▲
//!                                                                                       │ new token
//!                                                                        CredentialRefresher
//! ```
//!
//! # Features
//!
//! - **Backpressure**: a full queue fails submissions with `RESOURCE_EXHAUSTED`
//! - **Ordering**: items reach the backend in the order they were enqueued,
//!   across reconnects
//! - **Batching**: flush on item count, byte size or latency, whichever
//!   comes first; heartbeats keep an idle session alive
//! - **Encrypted delivery**: the intake session runs over TLS, optionally
//!   tunnelled through an authenticating HTTP proxy
//! - **Bounded loss**: the outbound write buffer is capped and every drop is
//!   counted
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_resync_relay::{
//!     DeliveryChannel, HostMetadata, IngestionServer, PipelineConfig, RelayConfig,
//!     ResyncProcessor, TcpConnector, TlsConnector, resync_queue,
//! };
//! use tokio::sync::watch;
//!
//! let config = RelayConfig::default();
//! let (_config_tx, config_rx) = watch::channel(Arc::new(PipelineConfig::new("intake:443", token)));
//! let (queue, drain) = resync_queue(config.queue_capacity);
//!
//! let connector = TlsConnector::with_webpki_roots(TcpConnector)?;
//! let channel = DeliveryChannel::new(Arc::new(connector), config_rx, config.channel.clone(), agent_id, hostname);
//! let processor = ResyncProcessor::new(channel, drain, &config, HostMetadata::placeholder(agent_id, hostname));
//! tokio::spawn(processor.run(shutdown));
//!
//! tonic::transport::Server::builder()
//!     .add_service(IngestionServer::new(queue, &config).into_service())
//!     .serve(addr)
//!     .await?;
//! ```

pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metadata;
mod metrics;
pub mod model;
pub mod processor;
pub mod proto;
pub mod queue;
pub mod server;
pub mod wire;

pub use channel::{
    ChannelEvent, ChannelObserver, ChannelState, ChannelStats, Connector, DeliveryChannel,
    DisconnectReason, TcpConnector, TlsConnector,
};
pub use config::{
    BatchConfig, ChannelOptions, PipelineConfig, ProxyConfig, ProxyCredentials, RelayConfig,
};
pub use credentials::{CredentialProvider, CredentialRefresher, Credentials, EnvCredentials};
pub use error::{
    ConfigError, CredentialError, MetadataError, RelayError, Result, SendError, SubmitError,
    ValidationError,
};
pub use metadata::{CloudMetadata, HostMetadata, MetadataSource, StaticMetadata};
pub use model::{ResourceKind, ResyncBatch, ResyncItem};
pub use processor::{HeartbeatClock, ProcessorState, ResyncProcessor};
pub use queue::{ResyncDrain, ResyncQueue, resync_queue};
pub use server::IngestionServer;
pub use wire::{Frame, FrameKind};
