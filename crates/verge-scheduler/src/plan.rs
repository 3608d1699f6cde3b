//! Plans and expectations.
//!
//! A decision or suggestion is lowered into an ordered list of steps. Each
//! step asks the connector for one mutation, names the event that confirms
//! it, and applies the confirmed change to the cluster state. The first
//! step runs immediately; every later step runs when its predecessor's
//! confirmation arrives, and receives that confirming event (a migrate-bind
//! needs it to learn the replacement replica's id).

use std::collections::HashMap;

use anyhow::{bail, Result};
use tracing::{info, warn};

use verge_alg::{fit_on_edge, presort_for_packing};
use verge_cluster::ClusterState;
use verge_common::{Decision, DeploymentId, Error, NodeId, Pod, PodStatus, Suggestion};
use verge_connector::{Connector, Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Placement of freshly-arrived replicas.
    Placing,
    /// A cloud-to-edge reorganisation.
    Reordering,
}

#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Terminate a replica.
    Delete { pod: Pod },
    /// Wait for the upstream controller to replace a deleted replica.
    Create { deployment: DeploymentId },
    /// Bind a known pending replica to a node.
    Bind { pod: Pod, node: NodeId },
    /// Bind the replica the previous step saw created to a node.
    MigrateBind { deployment: DeploymentId, node: NodeId },
}

#[derive(Debug, Clone)]
pub struct Expectation {
    pub id: u32,
    pub kind: PlanKind,
    pub step: PlanStep,
}

impl PlanStep {
    /// Does this event confirm the step?
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            PlanStep::Delete { pod } => {
                event.kind == EventKind::PodDeleted && event.pod.id == pod.id
            }
            PlanStep::Create { deployment } => {
                event.kind == EventKind::PodCreated && event.pod.deployment == *deployment
            }
            PlanStep::Bind { pod, node } => {
                event.kind == EventKind::PodChanged
                    && event.pod.id == pod.id
                    && event.node == Some(*node)
            }
            PlanStep::MigrateBind { deployment, node } => {
                event.kind == EventKind::PodChanged
                    && event.pod.deployment == *deployment
                    && event.node == Some(*node)
            }
        }
    }

    /// Issue the step's connector request. `trigger` is the event that
    /// confirmed the previous step, if any.
    pub async fn run<C: Connector + ?Sized>(
        &self,
        state: &ClusterState,
        connector: &C,
        trigger: Option<&Event>,
    ) -> Result<()> {
        match self {
            PlanStep::Delete { pod } => {
                if pod.status == PodStatus::Running && state.running_count(pod.deployment) <= 1 {
                    return Err(Error::StaleDecision {
                        pod: pod.id,
                        deployment: pod.deployment,
                    }
                    .into());
                }
                let existed = connector.delete(pod.id).await?;
                if !existed {
                    return Err(Error::Connector(format!(
                        "pod {} is already gone, cannot delete",
                        pod.id
                    ))
                    .into());
                }
                info!(pod = %pod.id, "requested pod deletion");
                Ok(())
            }
            PlanStep::Create { deployment } => {
                info!(deployment = %deployment, "waiting for the replacement replica");
                Ok(())
            }
            PlanStep::Bind { pod, node } => {
                connector.bind(pod.id, *node).await?;
                info!(pod = %pod.id, node = %node, "requested pod binding");
                Ok(())
            }
            PlanStep::MigrateBind { deployment, node } => {
                let Some(event) = trigger else {
                    bail!("migrate-bind for deployment {deployment} has no trigger event");
                };
                connector.bind(event.pod.id, *node).await?;
                info!(pod = %event.pod.id, node = %node, "requested migration binding");
                Ok(())
            }
        }
    }

    /// Apply the confirmed change to the cluster state.
    pub fn after(&self, state: &mut ClusterState, event: &Event) -> Result<()> {
        match self {
            PlanStep::Delete { pod } => {
                if !state.remove(pod.id) {
                    bail!("pod {} vanished from the cluster state", pod.id);
                }
                info!(pod = %pod.id, "pod deletion confirmed");
                Ok(())
            }
            PlanStep::Create { deployment } => {
                info!(deployment = %deployment, pod = %event.pod.id, "replacement replica confirmed");
                Ok(())
            }
            PlanStep::Bind { node, .. } | PlanStep::MigrateBind { node, .. } => {
                let pod = event.pod.clone();
                if state.is_edge_node(*node) {
                    match state.deploy_edge(pod.clone(), *node) {
                        Err(Error::InsufficientResources { .. }) => {
                            warn!(pod = %pod.id, node = %node, "bound replica no longer fits, recording on cloud");
                            state.deploy_cloud(pod);
                        }
                        other => other?,
                    }
                } else {
                    state.deploy_cloud(pod);
                }
                info!(pod = %event.pod.id, node = %node, "pod binding confirmed");
                Ok(())
            }
        }
    }
}

/// An ordered plan plus the pod-create churn it budgets per deployment
/// (consulted while a reordering plan is in flight).
#[derive(Debug, Default)]
pub struct Plan {
    pub steps: Vec<Expectation>,
    pub expected_creates: HashMap<DeploymentId, u32>,
}

struct PlanBuilder<'a> {
    kind: PlanKind,
    next_id: &'a mut u32,
    plan: Plan,
}

impl<'a> PlanBuilder<'a> {
    fn new(kind: PlanKind, next_id: &'a mut u32) -> Self {
        Self {
            kind,
            next_id,
            plan: Plan::default(),
        }
    }

    fn push(&mut self, step: PlanStep) {
        if let PlanStep::Create { deployment } = &step {
            *self.plan.expected_creates.entry(*deployment).or_insert(0) += 1;
        }
        self.plan.steps.push(Expectation {
            id: *self.next_id,
            kind: self.kind,
            step,
        });
        *self.next_id += 1;
    }

    /// Delete a replica and re-bind its controller-made replacement.
    fn push_move(&mut self, pod: &Pod, target: NodeId) {
        self.push(PlanStep::Delete { pod: pod.clone() });
        self.push(PlanStep::Create {
            deployment: pod.deployment,
        });
        self.push(PlanStep::MigrateBind {
            deployment: pod.deployment,
            node: target,
        });
    }
}

/// Lower a placement decision: evictions first, then in-edge moves, then
/// cloud binds, then edge binds against the post-eviction packing.
pub fn lower_decision(
    state: &ClusterState,
    decision: &Decision,
    kind: PlanKind,
    next_id: &mut u32,
) -> Plan {
    let mut builder = PlanBuilder::new(kind, next_id);

    for pod in &decision.evicted {
        match state.random_cloud_node() {
            Some(cloud) => builder.push_move(pod, cloud),
            None => warn!(pod = %pod.id, "no cloud node to evict to, skipping eviction"),
        }
    }

    for migration in &decision.migrations {
        match state.pod(migration.pod) {
            Some(pod) => builder.push_move(pod, migration.node),
            None => warn!(pod = %migration.pod, "migrating pod vanished, skipping move"),
        }
    }

    for pod in &decision.to_cloud {
        match state.random_cloud_node() {
            Some(cloud) => builder.push(PlanStep::Bind {
                pod: pod.clone(),
                node: cloud,
            }),
            None => warn!(pod = %pod.id, "no cloud node available, leaving pod pending"),
        }
    }

    for (pod, target) in edge_targets(state, decision, &decision.to_edge) {
        match target {
            Some(node) => builder.push(PlanStep::Bind { pod, node }),
            None => match state.random_cloud_node() {
                Some(cloud) => builder.push(PlanStep::Bind { pod, node: cloud }),
                None => warn!(pod = %pod.id, "pod fits neither tier, leaving it pending"),
            },
        }
    }

    builder.plan
}

/// Lower a reorder suggestion. Picks the inner decision kept on the cloud
/// are already running there and produce no steps; promoted picks are
/// deleted and their replacements bound to the planned edge nodes.
pub fn lower_suggestion(state: &ClusterState, suggestion: &Suggestion, next_id: &mut u32) -> Plan {
    let decision = &suggestion.decision;
    let mut builder = PlanBuilder::new(PlanKind::Reordering, next_id);

    for pod in &decision.evicted {
        match state.random_cloud_node() {
            Some(cloud) => builder.push_move(pod, cloud),
            None => warn!(pod = %pod.id, "no cloud node to evict to, skipping eviction"),
        }
    }

    for migration in &decision.migrations {
        match state.pod(migration.pod) {
            Some(pod) => builder.push_move(pod, migration.node),
            None => warn!(pod = %migration.pod, "migrating pod vanished, skipping move"),
        }
    }

    for (pod, target) in edge_targets(state, decision, &decision.to_edge) {
        match target {
            Some(node) => builder.push_move(&pod, node),
            None => warn!(pod = %pod.id, "promotion no longer fits the edge, skipping"),
        }
    }

    builder.plan
}

/// Pack the new edge replicas against the state the earlier plan steps
/// will have produced (evictions done, moves done, promotions off the
/// cloud), and pair each replica with its target node.
fn edge_targets(
    state: &ClusterState,
    decision: &Decision,
    pods: &[Pod],
) -> Vec<(Pod, Option<NodeId>)> {
    if pods.is_empty() {
        return Vec::new();
    }

    let mut speculative = state.clone();
    for pod in &decision.evicted {
        speculative.remove(pod.id);
    }
    for pod in pods {
        // Promotions still sit on the cloud; new replicas are unknown.
        speculative.remove(pod.id);
    }
    for migration in &decision.migrations {
        if let Some(pod) = speculative.pod(migration.pod).cloned() {
            speculative.remove(pod.id);
            if let Err(error) = speculative.deploy_edge(pod, migration.node) {
                warn!(%error, "speculative migration failed while lowering");
            }
        }
    }

    let mut ordered: Vec<Pod> = pods.to_vec();
    presort_for_packing(&speculative, &mut ordered);

    let config = &speculative.edge.config;
    let maxima = config.maximum_resources();
    let free = speculative.free_by_node();
    let refs: Vec<&Pod> = ordered.iter().collect();

    let assignment = match fit_on_edge(&refs, config, &free, &maxima) {
        Ok(Some(packing)) => packing.assignment,
        Ok(None) => {
            warn!("edge batch does not pack, falling back to cloud");
            HashMap::new()
        }
        Err(error) => {
            warn!(%error, "cannot pack the edge batch");
            HashMap::new()
        }
    };

    ordered
        .into_iter()
        .map(|pod| {
            let target = assignment.get(&pod.id).copied();
            (pod, target)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_common::{Deployment, Node, NodeTier, PodId, Resources};
    use verge_connector::SimConnector;

    fn fixture() -> (ClusterState, SimConnector) {
        let deployment = Deployment {
            id: DeploymentId(1),
            resources_required: Resources::new(vec![1.0, 1.0]),
            edge_share: 1.0,
        };
        let edge_node = Node {
            id: NodeId(1),
            resources: Resources::new(vec![2.0, 2.0]),
        };
        let cloud_node = Node {
            id: NodeId(2),
            resources: Resources::new(vec![1e9, 1e9]),
        };

        let mut state = ClusterState::new(2);
        state.register_deployment(deployment.clone());
        state.register_edge_node(edge_node.clone());
        state.register_cloud_node(cloud_node.clone());

        let sim = SimConnector::new(
            vec![(edge_node, NodeTier::Edge), (cloud_node, NodeTier::Cloud)],
            vec![deployment],
        );
        (state, sim)
    }

    #[tokio::test]
    async fn delete_guard_protects_the_last_running_replica() {
        let (mut state, sim) = fixture();
        let pod_id = sim.seed_pod(DeploymentId(1), Some(NodeId(1)), PodStatus::Running);
        let mut pod = Pod::new(pod_id, DeploymentId(1), PodStatus::Running);
        pod.node = Some(NodeId(1));
        state.deploy_edge(pod.clone(), NodeId(1)).unwrap();

        let step = PlanStep::Delete { pod };
        let err = step.run(&state, &sim, None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StaleDecision { .. })
        ));
        assert_eq!(sim.deletes_served(), 0, "the connector must never be asked");
    }

    #[tokio::test]
    async fn delete_goes_through_with_a_spare_replica() {
        let (mut state, sim) = fixture();
        let first = sim.seed_pod(DeploymentId(1), Some(NodeId(1)), PodStatus::Running);
        let second = sim.seed_pod(DeploymentId(1), None, PodStatus::Running);
        let mut pod = Pod::new(first, DeploymentId(1), PodStatus::Running);
        pod.node = Some(NodeId(1));
        state.deploy_edge(pod.clone(), NodeId(1)).unwrap();
        state.deploy_cloud(Pod::new(second, DeploymentId(1), PodStatus::Running));

        let step = PlanStep::Delete { pod };
        step.run(&state, &sim, None).await.unwrap();
        assert_eq!(sim.deletes_served(), 1);
    }

    #[test]
    fn bind_after_records_the_right_tier() {
        let (mut state, _sim) = fixture();
        let pod = Pod::new(PodId(10), DeploymentId(1), PodStatus::Scheduled);

        let step = PlanStep::Bind {
            pod: pod.clone(),
            node: NodeId(1),
        };
        let event = Event {
            kind: EventKind::PodChanged,
            pod,
            node: Some(NodeId(1)),
        };
        step.after(&mut state, &event).unwrap();
        assert_eq!(state.edge_pods().count(), 1);
        state.assert_invariants();
    }

    #[test]
    fn lowering_a_bind_only_decision_yields_bind_steps() {
        let (state, _sim) = fixture();
        let pod = Pod::new(PodId(10), DeploymentId(1), PodStatus::Scheduled);
        let decision = Decision {
            score: 1.0,
            evicted: vec![],
            to_edge: vec![pod.clone()],
            to_cloud: vec![],
            migrations: vec![],
        };

        let mut next_id = 0;
        let plan = lower_decision(&state, &decision, PlanKind::Placing, &mut next_id);
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(
            &plan.steps[0].step,
            PlanStep::Bind { node, .. } if *node == NodeId(1)
        ));
        assert!(plan.expected_creates.is_empty());
    }

    #[test]
    fn lowering_a_suggestion_budgets_the_churn() {
        let (mut state, _sim) = fixture();
        let mut promoted = Pod::new(PodId(10), DeploymentId(1), PodStatus::Running);
        promoted.node = Some(NodeId(2));
        state.deploy_cloud(promoted.clone());

        let suggestion = Suggestion {
            cloud_to_edge: vec![promoted.clone()],
            decision: Decision {
                score: 1.0,
                evicted: vec![],
                to_edge: vec![promoted],
                to_cloud: vec![],
                migrations: vec![],
            },
        };

        let mut next_id = 0;
        let plan = lower_suggestion(&state, &suggestion, &mut next_id);
        assert_eq!(plan.steps.len(), 3, "delete, create, migrate-bind");
        assert_eq!(plan.expected_creates[&DeploymentId(1)], 1);
        assert!(matches!(
            &plan.steps[2].step,
            PlanStep::MigrateBind { node, .. } if *node == NodeId(1)
        ));
    }
}
