//! Resync records and batches.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use tokio::time::Instant;

use crate::error::ValidationError;

/// Kubernetes kinds the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `v1/Pod`
    Pod,
    /// `v1/Node`
    Node,
    /// `v1/Service`
    Service,
    /// `v1/Namespace`
    Namespace,
    /// `apps/v1/ReplicaSet`
    ReplicaSet,
    /// `apps/v1/Deployment`
    Deployment,
    /// `batch/v1/Job`
    Job,
}

impl ResourceKind {
    /// Every recognized kind.
    pub const ALL: [Self; 7] = [
        Self::Pod,
        Self::Node,
        Self::Service,
        Self::Namespace,
        Self::ReplicaSet,
        Self::Deployment,
        Self::Job,
    ];

    /// Canonical kind name as used in object `kind` fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pod => Pod::KIND,
            Self::Node => Node::KIND,
            Self::Service => Service::KIND,
            Self::Namespace => Namespace::KIND,
            Self::ReplicaSet => ReplicaSet::KIND,
            Self::Deployment => Deployment::KIND,
            Self::Job => Job::KIND,
        }
    }

    /// `apiVersion` of the kind.
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Pod => Pod::API_VERSION,
            Self::Node => Node::API_VERSION,
            Self::Service => Service::API_VERSION,
            Self::Namespace => Namespace::API_VERSION,
            Self::ReplicaSet => ReplicaSet::API_VERSION,
            Self::Deployment => Deployment::API_VERSION,
            Self::Job => Job::API_VERSION,
        }
    }

    /// True for kinds that live outside any namespace.
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, Self::Node | Self::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ValidationError;

    /// Matches the kind name case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
    }
}

/// One normalized resync record.
///
/// Items are moved into the queue and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncItem {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Namespace, empty for cluster-scoped kinds.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Object UID.
    pub uid: String,
    /// Object resource version.
    pub resource_version: String,
    /// Serialized spec/status snapshot.
    pub payload: Vec<u8>,
    /// When the relay accepted the record.
    pub received_at: SystemTime,
}

/// Identity of a resync item: kind, namespace, name and resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemIdentity<'a> {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Namespace.
    pub namespace: &'a str,
    /// Object name.
    pub name: &'a str,
    /// Object resource version.
    pub resource_version: &'a str,
}

impl ResyncItem {
    /// Creates an item stamped with the current time.
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        resource_version: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            resource_version: resource_version.into(),
            payload,
            received_at: SystemTime::now(),
        }
    }

    /// The identity tuple of this item.
    pub fn identity(&self) -> ItemIdentity<'_> {
        ItemIdentity {
            kind: self.kind,
            namespace: &self.namespace,
            name: &self.name,
            resource_version: &self.resource_version,
        }
    }

    /// Bytes this item contributes to a batch's size threshold.
    pub fn weight(&self) -> usize {
        self.payload.len()
            + self.namespace.len()
            + self.name.len()
            + self.uid.len()
            + self.resource_version.len()
    }
}

/// Items accumulated within one flush window, in arrival order.
#[derive(Debug)]
pub struct ResyncBatch {
    items: Vec<ResyncItem>,
    bytes: usize,
    opened_at: Instant,
    split: bool,
}

impl ResyncBatch {
    /// Opens an empty batch at `opened_at`.
    pub fn open(opened_at: Instant) -> Self {
        Self {
            items: Vec::new(),
            bytes: 0,
            opened_at,
            split: false,
        }
    }

    /// Appends an item.
    pub fn push(&mut self, item: ResyncItem) {
        self.bytes += item.weight();
        self.items.push(item);
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no item has been added.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of item weights.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the batch was opened.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Items in arrival order.
    pub fn items(&self) -> &[ResyncItem] {
        &self.items
    }

    /// Moves the items from `at` onwards into a new batch opened at the same
    /// time. The returned batch is marked as split and takes no new items.
    #[must_use]
    pub fn split_off(&mut self, at: usize) -> ResyncBatch {
        let items = self.items.split_off(at);
        let bytes = items.iter().map(ResyncItem::weight).sum();
        self.bytes -= bytes;
        ResyncBatch {
            items,
            bytes,
            opened_at: self.opened_at,
            split: true,
        }
    }

    /// Appends the items of `other`, keeping their order.
    pub fn append(&mut self, mut other: ResyncBatch) {
        self.bytes += other.bytes;
        self.items.append(&mut other.items);
    }

    /// True for the tail cut off an oversized batch by [`Self::split_off`].
    pub fn is_split(&self) -> bool {
        self.split
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_follow_openapi() {
        assert_eq!(ResourceKind::Pod.as_str(), "Pod");
        assert_eq!(ResourceKind::ReplicaSet.api_version(), "apps/v1");
        assert_eq!(ResourceKind::Job.api_version(), "batch/v1");
        assert_eq!(ResourceKind::Namespace.to_string(), "Namespace");
    }

    #[test]
    fn kind_parse_is_case_insensitive() {
        assert_eq!("pod".parse::<ResourceKind>(), Ok(ResourceKind::Pod));
        assert_eq!(" Deployment ".parse::<ResourceKind>(), Ok(ResourceKind::Deployment));
        assert_eq!(
            "ConfigMap".parse::<ResourceKind>(),
            Err(ValidationError::UnknownKind("ConfigMap".to_string()))
        );
    }

    #[test]
    fn cluster_scoped_kinds() {
        let scoped: Vec<_> = ResourceKind::ALL
            .into_iter()
            .filter(|k| k.is_cluster_scoped())
            .collect();
        assert_eq!(scoped, vec![ResourceKind::Node, ResourceKind::Namespace]);
    }

    #[test]
    fn identity_ignores_uid_and_payload() {
        let a = ResyncItem::new(ResourceKind::Pod, "default", "web", "uid-1", "7", b"{}".to_vec());
        let b = ResyncItem::new(ResourceKind::Pod, "default", "web", "uid-2", "7", Vec::new());
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn batch_tracks_bytes_and_order() {
        let mut batch = ResyncBatch::open(Instant::now());
        assert!(batch.is_empty());

        batch.push(ResyncItem::new(ResourceKind::Node, "", "n1", "u1", "1", vec![0; 10]));
        batch.push(ResyncItem::new(ResourceKind::Node, "", "n2", "u2", "2", vec![0; 20]));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), (10 + 2 + 2 + 1) + (20 + 2 + 2 + 1));
        assert_eq!(batch.items()[0].name, "n1");
        assert_eq!(batch.items()[1].name, "n2");
    }

    #[test]
    fn split_off_moves_tail_and_bytes() {
        let opened = Instant::now();
        let mut batch = ResyncBatch::open(opened);
        for (name, size) in [("n1", 10), ("n2", 20), ("n3", 30)] {
            batch.push(ResyncItem::new(ResourceKind::Node, "", name, "u", "1", vec![0; size]));
        }
        let total = batch.bytes();

        let tail = batch.split_off(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.items()[0].name, "n2");
        assert_eq!(tail.opened_at(), opened);
        assert!(tail.is_split());
        assert!(!batch.is_split());
        assert_eq!(batch.bytes() + tail.bytes(), total);

        batch.append(tail);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.bytes(), total);
        assert_eq!(batch.items()[2].name, "n3");
    }
}
