use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use verge_common::{
    Deployment, DeploymentId, Error, Node, NodeId, Pod, PodId, PodStatus, Resources, Result,
};

/// Immutable-after-startup description of the edge tier.
#[derive(Debug, Clone, Default)]
pub struct EdgeConfig {
    pub nodes: Vec<Node>,
    pub deployments: HashMap<DeploymentId, Deployment>,
    /// Sum of edge node capacities.
    pub resources: Resources,
}

impl EdgeConfig {
    pub fn deployment(&self, id: DeploymentId) -> Result<&Deployment> {
        self.deployments.get(&id).ok_or(Error::UnknownDeployment(id))
    }

    /// Per-dimension maximum capacity across edge nodes: the `M` every
    /// defragmentation score is normalised by.
    pub fn maximum_resources(&self) -> Resources {
        let dim = self.resources.dim();
        let mut out = Resources::zeros(dim);
        for node in &self.nodes {
            out.max_with(&node.resources);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeState {
    pub config: EdgeConfig,
    /// Edge replica ids, in placement order.
    pub pods: Vec<PodId>,
    /// Aggregate used resources across edge nodes.
    pub used: Resources,
}

#[derive(Debug, Clone, Default)]
pub struct CloudState {
    pub nodes: Vec<Node>,
    pub pods: Vec<PodId>,
}

/// Authoritative in-memory view of the cluster.
///
/// Owned and mutated by the reconciler alone; everyone else works on a
/// clone. The mutation primitives keep these invariants:
/// per-node used never exceeds capacity, the aggregate edge usage equals
/// the per-node sum, every replica sits in exactly one tier list matching
/// its recorded placement, and the running tallies match replica statuses.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub edge: EdgeState,
    pub cloud: CloudState,
    pods: HashMap<PodId, Pod>,
    node_used: HashMap<NodeId, Resources>,
    running: HashMap<DeploymentId, u32>,
}

impl ClusterState {
    pub fn new(resource_count: usize) -> Self {
        Self {
            edge: EdgeState {
                config: EdgeConfig {
                    nodes: Vec::new(),
                    deployments: HashMap::new(),
                    resources: Resources::zeros(resource_count),
                },
                pods: Vec::new(),
                used: Resources::zeros(resource_count),
            },
            cloud: CloudState::default(),
            pods: HashMap::new(),
            node_used: HashMap::new(),
            running: HashMap::new(),
        }
    }

    /// Idempotent on id.
    pub fn register_deployment(&mut self, deployment: Deployment) {
        self.edge
            .config
            .deployments
            .entry(deployment.id)
            .or_insert(deployment);
    }

    pub fn register_edge_node(&mut self, node: Node) {
        let dim = node.resources.dim();
        self.edge.config.resources.add_assign(&node.resources);
        self.node_used.insert(node.id, Resources::zeros(dim));
        self.edge.config.nodes.push(node);
    }

    pub fn register_cloud_node(&mut self, node: Node) {
        self.cloud.nodes.push(node);
    }

    pub fn pod(&self, id: PodId) -> Option<&Pod> {
        self.pods.get(&id)
    }

    pub fn edge_pods(&self) -> impl Iterator<Item = &Pod> {
        self.edge.pods.iter().map(|id| &self.pods[id])
    }

    pub fn cloud_pods(&self) -> impl Iterator<Item = &Pod> {
        self.cloud.pods.iter().map(|id| &self.pods[id])
    }

    pub fn running_count(&self, deployment: DeploymentId) -> u32 {
        self.running.get(&deployment).copied().unwrap_or(0)
    }

    pub fn is_edge_node(&self, node: NodeId) -> bool {
        self.node_used.contains_key(&node)
    }

    pub fn node_used(&self, node: NodeId) -> Option<&Resources> {
        self.node_used.get(&node)
    }

    /// Aggregate free edge capacity.
    pub fn edge_free(&self) -> Resources {
        self.edge.config.resources.sub(&self.edge.used)
    }

    /// Remaining capacity per edge node.
    pub fn free_by_node(&self) -> HashMap<NodeId, Resources> {
        self.edge
            .config
            .nodes
            .iter()
            .map(|n| (n.id, n.resources.sub(&self.node_used[&n.id])))
            .collect()
    }

    pub fn random_cloud_node(&self) -> Option<NodeId> {
        self.cloud
            .nodes
            .choose(&mut rand::thread_rng())
            .map(|n| n.id)
    }

    fn required(&self, pod: &Pod) -> Result<Resources> {
        Ok(self
            .edge
            .config
            .deployment(pod.deployment)?
            .resources_required
            .clone())
    }

    /// Place a replica on an edge node, failing if it does not fit.
    pub fn deploy_edge(&mut self, mut pod: Pod, node: NodeId) -> Result<()> {
        let required = self.required(&pod)?;
        let capacity = self
            .edge
            .config
            .nodes
            .iter()
            .find(|n| n.id == node)
            .map(|n| n.resources.clone())
            .ok_or(Error::UnknownNode(node))?;

        let used = self.node_used.get_mut(&node).ok_or(Error::UnknownNode(node))?;
        if required.exceeds_any(&capacity.sub(used)) {
            return Err(Error::InsufficientResources { pod: pod.id, node });
        }

        used.add_assign(&required);
        self.edge.used.add_assign(&required);

        pod.node = Some(node);
        if pod.status == PodStatus::Running {
            *self.running.entry(pod.deployment).or_insert(0) += 1;
        }
        self.edge.pods.push(pod.id);
        self.pods.insert(pod.id, pod);
        Ok(())
    }

    /// Place a replica on the cloud. The node is picked uniformly at
    /// random among cloud nodes: the sole source of nondeterminism here.
    pub fn deploy_cloud(&mut self, mut pod: Pod) {
        pod.node = self.random_cloud_node();
        if pod.status == PodStatus::Running {
            *self.running.entry(pod.deployment).or_insert(0) += 1;
        }
        self.cloud.pods.push(pod.id);
        self.pods.insert(pod.id, pod);
    }

    /// Remove a replica from whichever tier holds it. Returns whether it
    /// was present; a missing replica is not an error.
    pub fn remove(&mut self, id: PodId) -> bool {
        if let Some(pos) = self.edge.pods.iter().position(|p| *p == id) {
            self.edge.pods.remove(pos);
            let pod = self.pods.remove(&id).expect("edge list entry has a pod record");
            let node = pod.node.expect("edge replica is bound to a node");
            if let Ok(required) = self
                .edge
                .config
                .deployment(pod.deployment)
                .map(|d| d.resources_required.clone())
            {
                if let Some(used) = self.node_used.get_mut(&node) {
                    used.sub_assign(&required);
                }
                self.edge.used.sub_assign(&required);
            }
            self.drop_running(&pod);
            return true;
        }

        if let Some(pos) = self.cloud.pods.iter().position(|p| *p == id) {
            self.cloud.pods.remove(pos);
            let pod = self.pods.remove(&id).expect("cloud list entry has a pod record");
            self.drop_running(&pod);
            return true;
        }

        false
    }

    fn drop_running(&mut self, pod: &Pod) {
        if pod.status == PodStatus::Running {
            if let Some(count) = self.running.get_mut(&pod.deployment) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Record a status transition, keeping the running tallies exact.
    /// Returns whether the replica is known.
    pub fn set_status(&mut self, id: PodId, status: PodStatus) -> bool {
        let Some(pod) = self.pods.get_mut(&id) else {
            return false;
        };
        let was_running = pod.status == PodStatus::Running;
        let is_running = status == PodStatus::Running;
        pod.status = status;
        let deployment = pod.deployment;
        if was_running && !is_running {
            if let Some(count) = self.running.get_mut(&deployment) {
                *count = count.saturating_sub(1);
            }
        } else if !was_running && is_running {
            *self.running.entry(deployment).or_insert(0) += 1;
        }
        true
    }

    /// Forget every replica while keeping nodes and deployments: the first
    /// half of a resync, before rediscovered placements are replayed.
    pub fn reset_pods(&mut self) {
        let dim = self.edge.used.dim();
        self.pods.clear();
        self.edge.pods.clear();
        self.cloud.pods.clear();
        self.running.clear();
        self.edge.used = Resources::zeros(dim);
        for used in self.node_used.values_mut() {
            *used = Resources::zeros(dim);
        }
    }

    /// Read-only serialisable view for observers.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            edge_nodes: self
                .edge
                .config
                .nodes
                .iter()
                .map(|n| NodeSnapshot {
                    id: n.id,
                    capacity: n.resources.clone(),
                    used: self.node_used[&n.id].clone(),
                })
                .collect(),
            cloud_nodes: self.cloud.nodes.clone(),
            edge_pods: self.edge_pods().cloned().collect(),
            cloud_pods: self.cloud_pods().cloned().collect(),
            edge_used: self.edge.used.clone(),
            edge_capacity: self.edge.config.resources.clone(),
        }
    }

    /// Panic unless every structural invariant holds. Test support; the
    /// deterministic harness prefers a loud failure over an error value.
    pub fn assert_invariants(&self) {
        let mut total = Resources::zeros(self.edge.used.dim());
        for node in &self.edge.config.nodes {
            let used = &self.node_used[&node.id];
            assert!(
                used.fits(&node.resources),
                "node {} used {} exceeds capacity {}",
                node.id,
                used,
                node.resources
            );
            total.add_assign(used);
        }
        assert_eq!(total, self.edge.used, "aggregate edge usage out of sync");

        assert_eq!(
            self.pods.len(),
            self.edge.pods.len() + self.cloud.pods.len(),
            "pod map does not match the tier lists"
        );
        for id in &self.edge.pods {
            let pod = &self.pods[id];
            let node = pod.node.expect("edge replica without a node");
            assert!(self.is_edge_node(node), "edge replica on a non-edge node");
            assert!(!self.cloud.pods.contains(id), "replica in both tiers");
        }

        let mut running: HashMap<DeploymentId, u32> = HashMap::new();
        for pod in self.pods.values() {
            if pod.status == PodStatus::Running {
                *running.entry(pod.deployment).or_insert(0) += 1;
            }
        }
        for (deployment, count) in &self.running {
            assert_eq!(
                running.get(deployment).copied().unwrap_or(0),
                *count,
                "running tally for deployment {deployment} out of sync"
            );
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub capacity: Resources,
    pub used: Resources,
}

/// What the state-query channel returns to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub edge_nodes: Vec<NodeSnapshot>,
    pub cloud_nodes: Vec<Node>,
    pub edge_pods: Vec<Pod>,
    pub cloud_pods: Vec<Pod>,
    pub edge_used: Resources,
    pub edge_capacity: Resources,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: u64, cpu: f64, mem: f64) -> Deployment {
        Deployment {
            id: DeploymentId(id),
            resources_required: Resources::new(vec![cpu, mem]),
            edge_share: 1.0,
        }
    }

    fn node(id: u64, cpu: f64, mem: f64) -> Node {
        Node {
            id: NodeId(id),
            resources: Resources::new(vec![cpu, mem]),
        }
    }

    fn pod(id: u64, deployment: u64) -> Pod {
        Pod::new(PodId(id), DeploymentId(deployment), PodStatus::Running)
    }

    fn small_cluster() -> ClusterState {
        let mut state = ClusterState::new(2);
        state.register_deployment(deployment(1, 1.0, 2.0));
        state.register_edge_node(node(10, 2.0, 4.0));
        state.register_cloud_node(node(90, 1e9, 1e9));
        state
    }

    #[test]
    fn deploy_then_remove_round_trips() {
        let mut state = small_cluster();
        let before = state.clone();

        state.deploy_edge(pod(100, 1), NodeId(10)).unwrap();
        state.assert_invariants();
        assert!(state.remove(PodId(100)));
        state.assert_invariants();

        assert_eq!(state.edge.used, before.edge.used);
        assert_eq!(state.node_used(NodeId(10)), before.node_used(NodeId(10)));
        assert!(state.pod(PodId(100)).is_none());
    }

    #[test]
    fn deploy_edge_rejects_overflow() {
        let mut state = small_cluster();
        state.deploy_edge(pod(100, 1), NodeId(10)).unwrap();
        state.deploy_edge(pod(101, 1), NodeId(10)).unwrap();
        let err = state.deploy_edge(pod(102, 1), NodeId(10)).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources { .. }));
        state.assert_invariants();
    }

    #[test]
    fn clone_is_isolated() {
        let mut state = small_cluster();
        state.deploy_edge(pod(100, 1), NodeId(10)).unwrap();

        let mut copy = state.clone();
        copy.deploy_edge(pod(101, 1), NodeId(10)).unwrap();
        assert!(copy.remove(PodId(100)));

        assert!(state.pod(PodId(100)).is_some());
        assert!(state.pod(PodId(101)).is_none());
        assert_eq!(state.edge.pods.len(), 1);
        state.assert_invariants();
    }

    #[test]
    fn running_tallies_follow_status() {
        let mut state = small_cluster();
        let mut p = pod(100, 1);
        p.status = PodStatus::Scheduled;
        state.deploy_edge(p, NodeId(10)).unwrap();
        assert_eq!(state.running_count(DeploymentId(1)), 0);

        state.set_status(PodId(100), PodStatus::Running);
        assert_eq!(state.running_count(DeploymentId(1)), 1);

        state.set_status(PodId(100), PodStatus::Finished);
        assert_eq!(state.running_count(DeploymentId(1)), 0);
        state.assert_invariants();
    }

    #[test]
    fn cloud_running_counts_too() {
        let mut state = small_cluster();
        state.deploy_cloud(pod(100, 1));
        assert_eq!(state.running_count(DeploymentId(1)), 1);
        assert!(state.remove(PodId(100)));
        assert_eq!(state.running_count(DeploymentId(1)), 0);
    }

    #[test]
    fn remove_missing_is_not_an_error() {
        let mut state = small_cluster();
        assert!(!state.remove(PodId(404)));
    }

    #[test]
    fn reset_pods_keeps_topology() {
        let mut state = small_cluster();
        state.deploy_edge(pod(100, 1), NodeId(10)).unwrap();
        state.deploy_cloud(pod(101, 1));
        state.reset_pods();

        assert_eq!(state.edge.pods.len(), 0);
        assert_eq!(state.cloud.pods.len(), 0);
        assert_eq!(state.edge.used, Resources::zeros(2));
        assert_eq!(state.edge.config.nodes.len(), 1);
        state.assert_invariants();
    }
}
