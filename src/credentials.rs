//! Intake credentials and their periodic refresh.
//!
//! Credentials are fetched once at startup (failure is fatal) and then
//! refreshed in the background. Each refresh publishes a new
//! [`PipelineConfig`] snapshot; the delivery channel picks it up on its next
//! connection attempt.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::PipelineConfig;
use crate::error::CredentialError;
use crate::metrics;

/// Endpoint and bearer token for the intake backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// `HOST:PORT` of the intake endpoint.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies intake credentials.
pub trait CredentialProvider: Send + Sync {
    /// Fetches the current credentials.
    fn fetch(&self) -> BoxFuture<'_, Result<Credentials, CredentialError>>;
}

/// Reads `RELAY_INTAKE_ENDPOINT` and `RELAY_INTAKE_TOKEN` on every fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    const ENDPOINT: &'static str = "RELAY_INTAKE_ENDPOINT";
    const TOKEN: &'static str = "RELAY_INTAKE_TOKEN";

    fn read(name: &'static str) -> Result<String, CredentialError> {
        env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(CredentialError::Missing(name))
    }
}

impl CredentialProvider for EnvCredentials {
    fn fetch(&self) -> BoxFuture<'_, Result<Credentials, CredentialError>> {
        let credentials = match (Self::read(Self::ENDPOINT), Self::read(Self::TOKEN)) {
            (Ok(endpoint), Ok(token)) => Ok(Credentials { endpoint, token }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        Box::pin(async move { credentials })
    }
}

/// Re-fetches credentials on a timer or on demand and publishes new
/// pipeline configs.
pub struct CredentialRefresher {
    provider: Arc<dyn CredentialProvider>,
    config_tx: watch::Sender<Arc<PipelineConfig>>,
    every: Duration,
    nudge: Arc<Notify>,
}

impl std::fmt::Debug for CredentialRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRefresher")
            .field("every", &self.every)
            .finish_non_exhaustive()
    }
}

impl CredentialRefresher {
    /// Creates a refresher publishing into `config_tx`.
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        config_tx: watch::Sender<Arc<PipelineConfig>>,
        every: Duration,
    ) -> Self {
        Self {
            provider,
            config_tx,
            every,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Handle that triggers an immediate refresh when notified.
    pub fn nudge(&self) -> Arc<Notify> {
        Arc::clone(&self.nudge)
    }

    /// Fetches once and publishes the result if it changed.
    ///
    /// # Errors
    ///
    /// The provider's error; the published config is left untouched.
    pub async fn refresh(&self) -> Result<bool, CredentialError> {
        let started = Instant::now();
        let result = self.provider.fetch().await;
        metrics::record_credential_refresh(result.is_ok(), started.elapsed());

        let credentials = result?;
        let changed = self.config_tx.send_if_modified(|current| {
            if current.endpoint == credentials.endpoint && current.token == credentials.token {
                return false;
            }
            *current = Arc::new(current.with_credentials(&credentials.endpoint, &credentials.token));
            true
        });

        if changed {
            tracing::info!(endpoint = %credentials.endpoint, "intake credentials refreshed");
        }
        Ok(changed)
    }

    /// Refreshes forever; runs until the task is aborted or every
    /// receiver is gone.
    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.every, self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.config_tx.is_closed() {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.nudge.notified() => {
                    tracing::info!("refreshing credentials after rejection");
                    ticker.reset();
                }
            }

            if let Err(e) = self.refresh().await {
                tracing::warn!("credential refresh failed, keeping previous token: {e}");
            }
        }
    }
}
