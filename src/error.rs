//! Error types for the relay.
//!
//! Each component owns a narrow error enum; [`RelayError`] is the top-level
//! type surfaced by startup and by the long-running tasks.
//!
//! | Error | Fatal | Where |
//! |-------|-------|-------|
//! | [`CredentialError`] | at startup only | credential provider |
//! | [`ConfigError`] | yes | configuration validation |
//! | [`SubmitError`] | no | queue, mapped to gRPC status |
//! | [`SendError`] | no | delivery channel |
//! | [`ValidationError`] | no | ingestion server |
//! | [`MetadataError`] | no | metadata enrichment, degraded to placeholder |

use std::time::Duration;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level failures of the relay process.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Credentials could not be obtained at startup.
    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),

    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The gRPC server failed.
    #[error("ingestion server error: {0}")]
    Server(#[from] tonic::transport::Error),

    /// Local I/O failure outside the delivery path (for example binding).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A long-running task stopped although nothing asked it to.
    #[error("{0} exited unexpectedly")]
    UnexpectedExit(&'static str),
}

/// Failure to obtain intake credentials.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// A required setting is absent.
    #[error("missing credential setting {0}")]
    Missing(&'static str),

    /// The credential source rejected the request or returned garbage.
    #[error("credential fetch failed: {0}")]
    Fetch(String),
}

/// Invalid relay configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A batch cannot fit into the outbound write buffer.
    #[error("max batch bytes {batch} must be at most half of the write buffer ({buffer} bytes)")]
    BatchExceedsBuffer {
        /// Configured batch byte limit.
        batch: usize,
        /// Configured write buffer cap.
        buffer: usize,
    },

    /// An address could not be parsed.
    #[error("invalid address {0:?}")]
    Address(String),

    /// The TLS client could not be set up.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// A queue submission failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue stayed at capacity for the whole submit wait.
    #[error("resync queue full after waiting {0:?}")]
    Full(Duration),

    /// The consumer side is gone; the relay is shutting down.
    #[error("resync queue closed")]
    Closed,
}

/// A frame could not be handed to the delivery channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel is not in the connected state.
    #[error("delivery channel is not connected")]
    NotConnected,

    /// Accepting the frame would overflow the write buffer.
    #[error("write buffer full ({buffered} of {capacity} bytes used, frame is {frame} bytes)")]
    BufferFull {
        /// Bytes currently buffered.
        buffered: usize,
        /// Write buffer cap.
        capacity: usize,
        /// Encoded frame size.
        frame: usize,
    },

    /// The frame alone exceeds the write buffer cap and was dropped.
    #[error("frame of {frame} bytes exceeds write buffer cap of {capacity} bytes")]
    FrameTooLarge {
        /// Encoded frame size.
        frame: usize,
        /// Write buffer cap.
        capacity: usize,
    },
}

impl SendError {
    /// True when the caller should keep its data and retry later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::FrameTooLarge { .. })
    }
}

/// A submission failed validation and was not enqueued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The resource kind is not one the relay forwards.
    #[error("unrecognized resource kind {0:?}")]
    UnknownKind(String),

    /// The submission carried no records.
    #[error("submission contains no records")]
    Empty,

    /// A required identity field is empty.
    #[error("record {index}: {field} must not be empty")]
    MissingField {
        /// Position of the record within the submission.
        index: usize,
        /// Name of the empty field.
        field: &'static str,
    },

    /// A cluster-scoped kind was given a namespace.
    #[error("record {index}: {kind} is cluster-scoped but namespace {namespace:?} was given")]
    UnexpectedNamespace {
        /// Position of the record within the submission.
        index: usize,
        /// Resource kind.
        kind: &'static str,
        /// Offending namespace.
        namespace: String,
    },

    /// The payload exceeds the per-item byte limit.
    #[error("record {index}: payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Position of the record within the submission.
        index: usize,
        /// Payload size.
        size: usize,
        /// Per-item limit.
        limit: usize,
    },

    /// The payload is not a Kubernetes object.
    #[error("record {index}: payload is not a Kubernetes object: {reason}")]
    MalformedPayload {
        /// Position of the record within the submission.
        index: usize,
        /// Parser message.
        reason: String,
    },

    /// The payload metadata disagrees with the record identity.
    #[error("record {index}: payload {field} {found:?} does not match record value {expected:?}")]
    IdentityMismatch {
        /// Position of the record within the submission.
        index: usize,
        /// Mismatched field.
        field: &'static str,
        /// Value carried by the record.
        expected: String,
        /// Value found in the payload metadata.
        found: String,
    },
}

/// Cloud or host metadata could not be fetched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The source did not answer within the configured timeout.
    #[error("metadata fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The source is not available in this environment.
    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}
