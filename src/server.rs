//! gRPC ingestion surface.
//!
//! Watchers in the cluster call `Submit` (one request) or `Collect` (a
//! client stream of requests) on the `k8s.relay.v1.ResyncRelay` service.
//! Every request is validated as a whole before any of its records is
//! enqueued; a full queue surfaces as `RESOURCE_EXHAUSTED` so callers back
//! off and retry.
//!
//! | Outcome | Status |
//! |---------|--------|
//! | invalid kind, identity or payload | `INVALID_ARGUMENT` |
//! | queue stayed full for the submit wait | `RESOURCE_EXHAUSTED` |
//! | relay shutting down | `UNAVAILABLE` |

use std::time::Duration;

use kube::core::DynamicObject;
use tonic::{Request, Response, Status, Streaming};

use crate::config::RelayConfig;
use crate::error::{SubmitError, ValidationError};
use crate::metrics;
use crate::model::{ResourceKind, ResyncItem};
use crate::proto::resync_relay_server::{ResyncRelay, ResyncRelayServer};
use crate::proto::{ResourceRecord, SubmitRequest, SubmitResponse};
use crate::queue::ResyncQueue;

/// Handles submissions and feeds the resync queue.
#[derive(Debug, Clone)]
pub struct IngestionServer {
    queue: ResyncQueue,
    submit_wait: Duration,
    max_item_bytes: usize,
}

impl IngestionServer {
    /// Creates a server feeding `queue`. Payloads larger than one batch are
    /// rejected.
    pub fn new(queue: ResyncQueue, config: &RelayConfig) -> Self {
        Self {
            queue,
            submit_wait: config.submit_wait,
            max_item_bytes: config.batch.max_bytes,
        }
    }

    /// Wraps the server into a tonic service.
    pub fn into_service(self) -> ResyncRelayServer<Self> {
        ResyncRelayServer::new(self)
    }

    /// Validates and enqueues one request, returning how many records were
    /// enqueued. On failure the count covers the records enqueued before it.
    async fn accept(&self, request: SubmitRequest) -> Result<usize, Rejection> {
        let items = normalize(request, self.max_item_bytes).map_err(Rejection::Invalid)?;
        let kind = items.first().map(|item| item.kind);

        let mut accepted = 0;
        for item in items {
            if let Err(e) = self.queue.submit(item, self.submit_wait).await {
                if let Some(kind) = kind.filter(|_| accepted > 0) {
                    metrics::record_items_submitted(kind.as_str(), accepted);
                }
                return Err(Rejection::Queue(e, accepted));
            }
            accepted += 1;
        }

        if let Some(kind) = kind {
            tracing::debug!(%kind, records = accepted, "submission enqueued");
            metrics::record_items_submitted(kind.as_str(), accepted);
        }
        Ok(accepted)
    }
}

/// Why a request was not (fully) enqueued.
#[derive(Debug)]
enum Rejection {
    Invalid(ValidationError),
    Queue(SubmitError, usize),
}

impl Rejection {
    fn into_status(self, accepted_before: usize) -> Status {
        match self {
            Self::Invalid(e) => {
                tracing::debug!("rejecting submission: {e}");
                metrics::record_submission_rejected("invalid_argument");
                Status::invalid_argument(e.to_string())
            }
            Self::Queue(e @ SubmitError::Full(_), accepted) => {
                let accepted = accepted_before + accepted;
                tracing::warn!(accepted, "rejecting submission: {e}");
                metrics::record_submission_rejected("resource_exhausted");
                Status::resource_exhausted(format!("{e}; {accepted} records accepted"))
            }
            Self::Queue(e @ SubmitError::Closed, accepted) => {
                let accepted = accepted_before + accepted;
                metrics::record_submission_rejected("unavailable");
                Status::unavailable(format!("{e}; {accepted} records accepted"))
            }
        }
    }
}

#[tonic::async_trait]
impl ResyncRelay for IngestionServer {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let accepted = self
            .accept(request.into_inner())
            .await
            .map_err(|rejection| rejection.into_status(0))?;

        Ok(Response::new(SubmitResponse {
            accepted: count(accepted),
        }))
    }

    async fn collect(
        &self,
        request: Request<Streaming<SubmitRequest>>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let mut stream = request.into_inner();
        let mut total = 0;

        while let Some(message) = stream.message().await? {
            total += self
                .accept(message)
                .await
                .map_err(|rejection| rejection.into_status(total))?;
        }

        tracing::debug!(records = total, "collect session finished");
        Ok(Response::new(SubmitResponse {
            accepted: count(total),
        }))
    }
}

fn count(records: usize) -> u32 {
    u32::try_from(records).unwrap_or(u32::MAX)
}

/// Validates a request and turns its records into resync items.
///
/// Nothing is returned unless every record is valid.
///
/// # Errors
///
/// The first problem found, identified by record index.
pub fn normalize(
    request: SubmitRequest,
    max_item_bytes: usize,
) -> Result<Vec<ResyncItem>, ValidationError> {
    let kind: ResourceKind = request.kind.parse()?;
    if request.records.is_empty() {
        return Err(ValidationError::Empty);
    }

    for (index, record) in request.records.iter().enumerate() {
        validate_record(kind, index, record, max_item_bytes)?;
    }

    Ok(request
        .records
        .into_iter()
        .map(|record| {
            ResyncItem::new(
                kind,
                record.namespace,
                record.name,
                record.uid,
                record.resource_version,
                record.payload,
            )
        })
        .collect())
}

fn validate_record(
    kind: ResourceKind,
    index: usize,
    record: &ResourceRecord,
    max_item_bytes: usize,
) -> Result<(), ValidationError> {
    let required = [
        ("name", &record.name),
        ("uid", &record.uid),
        ("resource_version", &record.resource_version),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField { index, field });
        }
    }

    if kind.is_cluster_scoped() {
        if !record.namespace.is_empty() {
            return Err(ValidationError::UnexpectedNamespace {
                index,
                kind: kind.as_str(),
                namespace: record.namespace.clone(),
            });
        }
    } else if record.namespace.trim().is_empty() {
        return Err(ValidationError::MissingField {
            index,
            field: "namespace",
        });
    }

    if record.payload.len() > max_item_bytes {
        return Err(ValidationError::PayloadTooLarge {
            index,
            size: record.payload.len(),
            limit: max_item_bytes,
        });
    }

    if record.payload.is_empty() {
        return Ok(());
    }

    let object: DynamicObject =
        serde_json::from_slice(&record.payload).map_err(|e| ValidationError::MalformedPayload {
            index,
            reason: e.to_string(),
        })?;

    let declared_kind = object.types.as_ref().map(|types| types.kind.as_str());
    let checks = [
        ("kind", kind.as_str(), declared_kind),
        ("name", record.name.as_str(), object.metadata.name.as_deref()),
        ("uid", record.uid.as_str(), object.metadata.uid.as_deref()),
        (
            "namespace",
            record.namespace.as_str(),
            object.metadata.namespace.as_deref(),
        ),
    ];
    for (field, expected, found) in checks {
        match found {
            Some(found) if !found.is_empty() && found != expected => {
                return Err(ValidationError::IdentityMismatch {
                    index,
                    field,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(())
}
