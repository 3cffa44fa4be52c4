//! The resync relay binary.
//!
//! # Environment Variables
//!
//! - `RELAY_INTAKE_ENDPOINT`, `RELAY_INTAKE_TOKEN`: intake credentials (required)
//! - `RELAY_INTAKE_PLAINTEXT`: `true` disables TLS towards the intake (default: `false`)
//! - `RELAY_SERVER_ADDRESS`: gRPC listen address (default: `localhost:8712`)
//! - `RELAY_HEARTBEAT_INTERVAL_SEC`: heartbeat interval (default: 30)
//! - `RELAY_METADATA_TIMEOUT_MS`: cloud metadata lookup bound (default: 1000)
//! - `RELAY_WRITE_BUFFER_BYTES`: outbound write buffer cap (default: 4 MiB)
//! - `RELAY_METRICS_ADDRESS`: Prometheus listen address (disabled when unset)
//! - `https_proxy` / `no_proxy`: optional HTTP CONNECT proxy
//! - `RUST_LOG`: log filter (default: `info`)

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use k8s_resync_relay::metadata;
use k8s_resync_relay::{
    ConfigError, Connector, CredentialProvider, CredentialRefresher, DeliveryChannel,
    EnvCredentials, HostMetadata, IngestionServer, PipelineConfig, ProxyConfig, RelayConfig,
    RelayError, ResyncProcessor, Result, StaticMetadata, TcpConnector, TlsConnector,
    resync_queue,
};
use tokio::sync::{oneshot, watch};
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use uuid::Uuid;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid {name}={raw:?}");
            None
        }
    }
}

fn init_metrics() {
    let Ok(addr) = env::var("RELAY_METRICS_ADDRESS") else {
        return;
    };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(sock)
            .install()
        {
            Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid RELAY_METRICS_ADDRESS; expected host:port"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("termination signal received, shutting down");
}

fn intake_connector() -> Result<Arc<dyn Connector>> {
    if env_parse("RELAY_INTAKE_PLAINTEXT").unwrap_or(false) {
        warn!("TLS disabled; the intake token is sent in clear text");
        return Ok(Arc::new(TcpConnector));
    }
    let connector = TlsConnector::with_webpki_roots(TcpConnector)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    Ok(Arc::new(connector))
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ConfigError::Address(address.to_string()).into())
}

async fn run() -> Result<()> {
    let mut config = RelayConfig::default();
    if let Ok(address) = env::var("RELAY_SERVER_ADDRESS") {
        config.server_address = address;
    }
    if let Some(ms) = env_parse("RELAY_METADATA_TIMEOUT_MS") {
        config.metadata_timeout = Duration::from_millis(ms);
    }

    let provider: Arc<dyn CredentialProvider> = Arc::new(EnvCredentials);
    let credentials = provider.fetch().await?;

    let mut pipeline = PipelineConfig::new(credentials.endpoint, credentials.token);
    pipeline.proxy = ProxyConfig::from_env();
    if let Some(secs) = env_parse("RELAY_HEARTBEAT_INTERVAL_SEC") {
        pipeline.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(bytes) = env_parse("RELAY_WRITE_BUFFER_BYTES") {
        pipeline.write_buffer_bytes = bytes;
    }
    config.validate(&pipeline)?;

    init_metrics();

    let agent_id = Uuid::new_v4().to_string();
    let hostname = metadata::hostname();
    let addr = resolve(&config.server_address).await?;
    info!(%agent_id, %hostname, endpoint = %pipeline.endpoint, "starting resync relay");

    let connector = intake_connector()?;
    let (config_tx, config_rx) = watch::channel(Arc::new(pipeline));
    let refresher = CredentialRefresher::new(provider, config_tx, config.credential_refresh);
    let channel = DeliveryChannel::new(
        connector,
        config_rx,
        config.channel.clone(),
        agent_id.as_str(),
        hostname.as_str(),
    )
    .with_refresh_hint(refresher.nudge());

    let (queue, drain) = resync_queue(config.queue_capacity);
    let processor = ResyncProcessor::new(
        channel,
        drain,
        &config,
        HostMetadata::placeholder(agent_id, hostname),
    )
    .with_metadata_source(Arc::new(StaticMetadata::from_env()));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let refresh_task = tokio::spawn(refresher.run());
    let mut driver = tokio::spawn(processor.run(async move {
        let _ = stop_rx.await;
    }));

    info!("resync relay listening on {addr}");
    let server = Server::builder()
        .add_service(IngestionServer::new(queue, &config).into_service())
        .serve_with_shutdown(addr, shutdown_signal());

    let outcome = tokio::select! {
        result = server => result.map_err(RelayError::from),
        _ = &mut driver => Err(RelayError::UnexpectedExit("resync processor")),
    };
    refresh_task.abort();
    outcome?;

    // The server is down and the queue has no producers left.
    let _ = stop_tx.send(());
    let grace = config.shutdown_grace + Duration::from_secs(1);
    if tokio::time::timeout(grace, driver).await.is_err() {
        warn!("resync processor did not stop within {grace:?}");
    }

    info!("resync relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
