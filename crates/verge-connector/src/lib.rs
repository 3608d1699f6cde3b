//! The cluster-API boundary.
//!
//! The scheduler never talks to a cluster directly; everything goes through
//! the [`Connector`] trait. A connector lists topology once at startup,
//! streams pod lifecycle events, and executes bind/delete requests whose
//! confirmations come back through that same stream.

pub mod sim;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use verge_common::{Deployment, Node, NodeId, NodeTier, Pod, PodId};

pub use sim::SimConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PodCreated,
    PodChanged,
    PodDeleted,
}

/// A pod lifecycle event. The pod snapshot carries the status; `node` is
/// set on placement changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub pod: Pod,
    pub node: Option<NodeId>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// What a resync rediscovers: replicas that are placed somewhere (their
/// `node` field says where) and replicas still waiting for a binding.
#[derive(Debug, Clone, Default)]
pub struct ResyncView {
    pub placed: Vec<Pod>,
    pub pending: Vec<Pod>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Discover nodes, each labelled with the tier it belongs to.
    async fn list_nodes(&self) -> Result<Vec<(Node, NodeTier)>>;

    /// Discover deployments with their resource requests and edge shares.
    async fn list_deployments(&self) -> Result<Vec<Deployment>>;

    /// Rebuild the replica view from scratch.
    async fn resync(&self) -> Result<ResyncView>;

    /// Ask the cluster to run `pod` on `node`. Confirmed by a later
    /// `PodChanged` event carrying the same pair.
    async fn bind(&self, pod: PodId, node: NodeId) -> Result<()>;

    /// Ask the cluster to terminate `pod`. Returns whether the pod existed;
    /// a later `PodDeleted` event confirms the termination.
    async fn delete(&self, pod: PodId) -> Result<bool>;

    /// Subscribe to pod lifecycle events, in emission order.
    async fn watch(&self) -> Result<EventStream>;
}
