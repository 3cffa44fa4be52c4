//! Messages and generated stubs of the `k8s.relay.v1.ResyncRelay` service.
//!
//! The service definition lives in `build.rs`; the message types are
//! declared here so no `protoc` is needed at build time.

/// A batch of records of one resource kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitRequest {
    /// Kind name, for example `Pod` or `Deployment`.
    #[prost(string, tag = "1")]
    pub kind: String,
    /// Records in the order they should be delivered.
    #[prost(message, repeated, tag = "2")]
    pub records: Vec<ResourceRecord>,
}

/// One object snapshot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceRecord {
    /// Namespace; empty for cluster-scoped kinds.
    #[prost(string, tag = "1")]
    pub namespace: String,
    /// Object name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Object UID.
    #[prost(string, tag = "3")]
    pub uid: String,
    /// Resource version of the snapshot.
    #[prost(string, tag = "4")]
    pub resource_version: String,
    /// Serialized object, usually JSON.
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

/// Result of a submission.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitResponse {
    /// Records enqueued for delivery.
    #[prost(uint32, tag = "1")]
    pub accepted: u32,
}

#[allow(missing_docs, clippy::pedantic)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/k8s.relay.v1.ResyncRelay.rs"));
}

pub use generated::{resync_relay_client, resync_relay_server};
