use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(DeploymentId);
id_type!(NodeId);
id_type!(PodId);

/// The scheduling unit: a replica template plus the target fraction of its
/// replicas that should run on the edge. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub resources_required: Resources,
    /// Target edge fraction in `[0, 1]`.
    pub edge_share: f64,
}

/// A compute node with a fixed capacity. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub resources: Resources,
}

/// Tier label a connector attaches to each discovered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTier {
    Edge,
    Cloud,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Scheduled,
    Running,
    Finished,
}

/// One replica of a deployment. Created by cluster events; mutated only
/// through the cluster-state primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub deployment: DeploymentId,
    pub node: Option<NodeId>,
    pub status: PodStatus,
}

impl Pod {
    pub fn new(id: PodId, deployment: DeploymentId, status: PodStatus) -> Self {
        Self {
            id,
            deployment,
            node: None,
            status,
        }
    }
}

/// An in-edge move: delete the replica and re-create it bound to `node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub pod: PodId,
    pub node: NodeId,
}

/// The outcome of one decision pass over a batch of new replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub score: f64,
    /// Incumbent edge replicas offloaded to the cloud to make room.
    pub evicted: Vec<Pod>,
    pub to_edge: Vec<Pod>,
    pub to_cloud: Vec<Pod>,
    pub migrations: Vec<Migration>,
}

impl Decision {
    /// The decision produced when no partition of the batch is feasible.
    pub fn none() -> Self {
        Self {
            score: f64::NEG_INFINITY,
            evicted: Vec::new(),
            to_edge: Vec::new(),
            to_cloud: Vec::new(),
            migrations: Vec::new(),
        }
    }

    /// True when applying the decision would not touch the cluster.
    pub fn is_noop(&self) -> bool {
        self.evicted.is_empty()
            && self.to_edge.is_empty()
            && self.to_cloud.is_empty()
            && self.migrations.is_empty()
    }
}

/// A periodic cloud-to-edge reorganisation: the cloud replicas worth
/// promoting, plus the decision that places them (and whatever evictions
/// and in-edge moves it implies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub cloud_to_edge: Vec<Pod>,
    pub decision: Decision,
}

impl Suggestion {
    pub fn empty() -> Self {
        Self {
            cloud_to_edge: Vec::new(),
            decision: Decision::none(),
        }
    }
}
