use std::collections::HashMap;

use verge_cluster::ClusterState;
use verge_common::{Deployment, DeploymentId, Node, NodeId, Pod, PodId, PodStatus, Resources};

/// Capacity a test node in the "unbounded" cloud tier reports.
const CLOUD_NODE_CAPACITY: f64 = 1e9;

#[derive(Debug, Clone)]
pub struct DeploymentDesc {
    pub name: String,
    pub cpu: f64,
    pub memory: f64,
    pub edge_share: f64,
}

impl DeploymentDesc {
    pub fn new(name: &str, cpu: f64, memory: f64, edge_share: f64) -> Self {
        Self {
            name: name.to_string(),
            cpu,
            memory,
            edge_share,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeDesc {
    pub cpu: f64,
    pub memory: f64,
}

impl NodeDesc {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }
}

/// Builds clusters out of name-keyed descriptions and checks end states
/// against them. Pod and node ids are handed out sequentially, so a single
/// builder can mint batches for successive scheduling rounds.
pub struct ClusterBuilder {
    deployments: HashMap<String, Deployment>,
    names: HashMap<DeploymentId, String>,
    next_pod: u64,
    next_node: u64,
}

impl ClusterBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            deployments: HashMap::new(),
            names: HashMap::new(),
            next_pod: 1,
            next_node: 1,
        }
    }

    pub fn import_deployments(&mut self, descs: &[DeploymentDesc]) {
        let base = self.deployments.len() as u64;
        for (index, desc) in descs.iter().enumerate() {
            let id = DeploymentId(base + index as u64 + 1);
            self.deployments.insert(
                desc.name.clone(),
                Deployment {
                    id,
                    resources_required: Resources::new(vec![desc.cpu, desc.memory]),
                    edge_share: desc.edge_share,
                },
            );
            self.names.insert(id, desc.name.clone());
        }
    }

    pub fn deployment_id(&self, name: &str) -> DeploymentId {
        self.deployments
            .get(name)
            .unwrap_or_else(|| panic!("there is no deployment named {name}"))
            .id
    }

    /// Mint running pods for the given deployment names.
    pub fn pods(&mut self, names: &[&str]) -> Vec<Pod> {
        names
            .iter()
            .map(|name| {
                let deployment = self.deployment_id(name);
                let pod = Pod::new(PodId(self.next_pod), deployment, PodStatus::Running);
                self.next_pod += 1;
                pod
            })
            .collect()
    }

    /// Build a cluster: each edge node with its initial replicas, plus one
    /// effectively-unbounded cloud node holding the cloud replicas.
    pub fn cluster(&mut self, edge: &[(NodeDesc, &[&str])], cloud: &[&str]) -> ClusterState {
        let mut state = ClusterState::new(2);

        for deployment in self.deployments.values() {
            state.register_deployment(deployment.clone());
        }

        for (desc, pod_names) in edge {
            let node = Node {
                id: NodeId(self.next_node),
                resources: Resources::new(vec![desc.cpu, desc.memory]),
            };
            self.next_node += 1;
            let node_id = node.id;
            state.register_edge_node(node);

            for pod in self.pods(pod_names) {
                state
                    .deploy_edge(pod, node_id)
                    .expect("fixture pods fit their node");
            }
        }

        state.register_cloud_node(Node {
            id: NodeId(self.next_node),
            resources: Resources::new(vec![CLOUD_NODE_CAPACITY, CLOUD_NODE_CAPACITY]),
        });
        self.next_node += 1;

        for pod in self.pods(cloud) {
            state.deploy_cloud(pod);
        }

        state.assert_invariants();
        state
    }

    /// Assert that `state` holds exactly the wanted replicas, matching
    /// edge replicas by the capacity of the node they sit on and cloud
    /// replicas as `(0, 0)` occurrences.
    pub fn expect(
        &self,
        state: &ClusterState,
        want_edge: &[(NodeDesc, &[&str])],
        want_cloud: &[&str],
    ) {
        let node_capacity: HashMap<NodeId, NodeDesc> = state
            .edge
            .config
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id,
                    NodeDesc::new(n.resources.get(0), n.resources.get(1)),
                )
            })
            .collect();

        let mut got: HashMap<String, Vec<NodeDesc>> = HashMap::new();
        for pod in state.edge_pods() {
            let name = self.name_of(pod.deployment);
            let node = pod.node.expect("edge pod has a node");
            got.entry(name).or_default().push(node_capacity[&node]);
        }
        for pod in state.cloud_pods() {
            let name = self.name_of(pod.deployment);
            got.entry(name).or_default().push(NodeDesc::new(0.0, 0.0));
        }

        let mut want: HashMap<String, Vec<NodeDesc>> = HashMap::new();
        for (desc, pod_names) in want_edge {
            for name in *pod_names {
                want.entry(name.to_string()).or_default().push(*desc);
            }
        }
        for name in want_cloud {
            want.entry(name.to_string())
                .or_default()
                .push(NodeDesc::new(0.0, 0.0));
        }

        for (name, mut want_occurrences) in want {
            let mut got_occurrences = got.remove(&name).unwrap_or_else(|| {
                panic!("expected replicas of {name}, but the cluster has none")
            });
            sort_occurrences(&mut want_occurrences);
            sort_occurrences(&mut got_occurrences);

            assert_eq!(
                got_occurrences.len(),
                want_occurrences.len(),
                "wrong replica count for {name}: got {got_occurrences:?}, want {want_occurrences:?}"
            );
            for (got_occurrence, want_occurrence) in got_occurrences.iter().zip(&want_occurrences) {
                assert_eq!(
                    got_occurrence, want_occurrence,
                    "misplaced replica of {name}: got {got_occurrences:?}, want {want_occurrences:?}"
                );
            }
        }

        assert!(
            got.is_empty(),
            "cluster holds replicas of unexpected deployments: {:?}",
            got.keys().collect::<Vec<_>>()
        );
    }

    fn name_of(&self, id: DeploymentId) -> String {
        self.names
            .get(&id)
            .unwrap_or_else(|| panic!("unknown deployment id {id}"))
            .clone()
    }
}

fn sort_occurrences(occurrences: &mut [NodeDesc]) {
    occurrences.sort_by(|a, b| {
        a.cpu
            .total_cmp(&b.cpu)
            .then_with(|| a.memory.total_cmp(&b.memory))
    });
}
