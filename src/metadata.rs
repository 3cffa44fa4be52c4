//! Host and cloud metadata attached to every batch.
//!
//! Cloud instance metadata comes from an injected [`MetadataSource`]; the
//! lookup is bounded by a timeout and degrades to a placeholder so the
//! processor never blocks on it.

use std::env;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::MetadataError;
use crate::metrics;
use crate::wire::WireMetadata;

/// Value used for any metadata field that could not be determined.
pub const UNKNOWN: &str = "(unknown)";

/// Cloud instance details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMetadata {
    /// Provider name, for example `aws`.
    pub provider: String,
    /// Region.
    pub region: String,
    /// Availability zone.
    pub zone: String,
    /// Instance id.
    pub instance_id: String,
}

impl CloudMetadata {
    /// Placeholder used when the lookup fails or times out.
    pub fn unknown() -> Self {
        Self {
            provider: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            zone: UNKNOWN.to_string(),
            instance_id: UNKNOWN.to_string(),
        }
    }
}

/// Identity of this relay instance and the host it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMetadata {
    /// Agent id generated at startup.
    pub agent_id: String,
    /// Hostname.
    pub hostname: String,
    /// Cloud instance details.
    pub cloud: CloudMetadata,
}

impl HostMetadata {
    /// Metadata with unknown cloud details.
    pub fn placeholder(agent_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            cloud: CloudMetadata::unknown(),
        }
    }

    pub(crate) fn to_wire(&self) -> WireMetadata {
        WireMetadata {
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            cloud_provider: self.cloud.provider.clone(),
            region: self.cloud.region.clone(),
            zone: self.cloud.zone.clone(),
            instance_id: self.cloud.instance_id.clone(),
        }
    }
}

/// Supplies cloud instance metadata.
pub trait MetadataSource: Send + Sync {
    /// Looks up the metadata. May take arbitrarily long; callers bound it.
    fn fetch(&self) -> BoxFuture<'_, Result<CloudMetadata, MetadataError>>;
}

/// A source that always returns the same answer.
#[derive(Debug, Clone)]
pub struct StaticMetadata(pub Result<CloudMetadata, MetadataError>);

impl StaticMetadata {
    /// Reads `RELAY_CLOUD_PROVIDER`, `RELAY_CLOUD_REGION`, `RELAY_CLOUD_ZONE`
    /// and `RELAY_CLOUD_INSTANCE_ID`; unavailable when no provider is set.
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).unwrap_or_else(|_| UNKNOWN.to_string());

        match env::var("RELAY_CLOUD_PROVIDER") {
            Ok(provider) if !provider.is_empty() => Self(Ok(CloudMetadata {
                provider,
                region: read("RELAY_CLOUD_REGION"),
                zone: read("RELAY_CLOUD_ZONE"),
                instance_id: read("RELAY_CLOUD_INSTANCE_ID"),
            })),
            _ => Self(Err(MetadataError::Unavailable(
                "no cloud provider configured".to_string(),
            ))),
        }
    }
}

impl MetadataSource for StaticMetadata {
    fn fetch(&self) -> BoxFuture<'_, Result<CloudMetadata, MetadataError>> {
        let result = self.0.clone();
        Box::pin(async move { result })
    }
}

/// Hostname from `HOSTNAME`, or [`UNKNOWN`].
pub fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            tracing::error!("unable to determine host name, using {UNKNOWN}");
            UNKNOWN.to_string()
        })
}

/// Builds host metadata, waiting at most `timeout` for the cloud lookup.
pub async fn enrich(
    source: &dyn MetadataSource,
    agent_id: &str,
    hostname: &str,
    timeout: Duration,
) -> HostMetadata {
    let result = match tokio::time::timeout(timeout, source.fetch()).await {
        Ok(result) => result,
        Err(_) => Err(MetadataError::Timeout(timeout)),
    };

    let cloud = match result {
        Ok(cloud) => {
            tracing::info!(
                provider = %cloud.provider,
                region = %cloud.region,
                zone = %cloud.zone,
                "cloud metadata resolved"
            );
            cloud
        }
        Err(e) => {
            let reason = match e {
                MetadataError::Timeout(_) => "timeout",
                MetadataError::Unavailable(_) => "unavailable",
            };
            tracing::warn!("cloud metadata lookup failed, using placeholder: {e}");
            metrics::record_metadata_fallback(reason);
            CloudMetadata::unknown()
        }
    };

    HostMetadata {
        agent_id: agent_id.to_string(),
        hostname: hostname.to_string(),
        cloud,
    }
}
