//! End-to-end reconciler runs against the sim connector: every mutation
//! travels through plan steps and watch-event confirmations.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use verge_cluster::ClusterSnapshot;
use verge_common::{
    Deployment, DeploymentId, Node, NodeId, NodeTier, PodStatus, Resources, SchedulerConfig,
};
use verge_connector::SimConnector;
use verge_scheduler::metrics::counters;
use verge_scheduler::{Reconciler, StateHandle, Stats};

struct Harness {
    sim: SimConnector,
    handle: StateHandle,
    stats: Stats,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        flush_period: Duration::from_millis(100),
        // Keep the periodic passes out of the way unless a test wants them.
        cloud_suggest_period: Duration::from_secs(3600),
        health_check_period: Duration::from_secs(3600),
        recover_retry_period: Duration::from_millis(100),
        ..Default::default()
    }
}

async fn start(sim: SimConnector, config: SchedulerConfig) -> Harness {
    let stats = Stats::default();
    let cancel = CancellationToken::new();
    let (reconciler, handle) = Reconciler::new(
        Arc::new(sim.clone()),
        config,
        stats.clone(),
        cancel.clone(),
    );
    tokio::spawn(reconciler.run());

    let harness = Harness {
        sim,
        handle,
        stats,
        cancel,
    };
    // The query channel answers once the loop is up.
    harness
        .wait_until(|_| true)
        .await;
    harness
}

impl Harness {
    async fn wait_until<F>(&self, condition: F) -> ClusterSnapshot
    where
        F: Fn(&ClusterSnapshot) -> bool,
    {
        for _ in 0..300 {
            if let Some(snapshot) = self.handle.get().await {
                if condition(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("the cluster never reached the expected shape");
    }
}

fn edge_node(id: u64, cpu: f64, mem: f64) -> (Node, NodeTier) {
    (
        Node {
            id: NodeId(id),
            resources: Resources::new(vec![cpu, mem]),
        },
        NodeTier::Edge,
    )
}

fn cloud_node(id: u64) -> (Node, NodeTier) {
    (
        Node {
            id: NodeId(id),
            resources: Resources::new(vec![1e9, 1e9]),
        },
        NodeTier::Cloud,
    )
}

fn deployment(id: u64, cpu: f64, mem: f64, edge_share: f64) -> Deployment {
    Deployment {
        id: DeploymentId(id),
        resources_required: Resources::new(vec![cpu, mem]),
        edge_share,
    }
}

#[tokio::test(start_paused = true)]
async fn places_new_replicas_on_the_edge() {
    let sim = SimConnector::new(
        vec![edge_node(1, 2.0, 4.0), cloud_node(9)],
        vec![deployment(1, 1.0, 1.5, 1.0), deployment(2, 1.0, 2.0, 1.0)],
    );
    let harness = start(sim, test_config()).await;

    let a = harness.sim.spawn_pod(DeploymentId(1));
    let b = harness.sim.spawn_pod(DeploymentId(2));

    let snapshot = harness
        .wait_until(|s| s.edge_pods.len() == 2 && s.cloud_pods.is_empty())
        .await;
    for pod in &snapshot.edge_pods {
        assert_eq!(pod.node, Some(NodeId(1)));
    }

    // Status transitions ride the same stream without disturbing anything.
    harness.sim.mark_running(a);
    harness.sim.mark_running(b);
    harness
        .wait_until(|s| {
            s.edge_pods
                .iter()
                .all(|pod| pod.status == PodStatus::Running)
        })
        .await;

    assert_eq!(harness.stats.get(counters::EXPECTATION_FLUSHES), 0);
}

#[tokio::test(start_paused = true)]
async fn eviction_walks_the_delete_create_bind_chain() {
    // The edge node only fits one replica. A tolerates the cloud
    // (edge_share 0) and has a second replica there, so it may be evicted;
    // B insists on the edge.
    let sim = SimConnector::new(
        vec![edge_node(1, 1.0, 1.0), cloud_node(9)],
        vec![deployment(1, 1.0, 1.0, 0.0), deployment(2, 1.0, 1.0, 1.0)],
    );
    sim.seed_pod(DeploymentId(1), Some(NodeId(1)), PodStatus::Running);
    sim.seed_pod(DeploymentId(1), Some(NodeId(9)), PodStatus::Running);

    let harness = start(sim, test_config()).await;
    harness
        .wait_until(|s| s.edge_pods.len() == 1 && s.cloud_pods.len() == 1)
        .await;

    harness.sim.spawn_pod(DeploymentId(2));

    let snapshot = harness
        .wait_until(|s| {
            s.edge_pods.len() == 1
                && s.edge_pods[0].deployment == DeploymentId(2)
                && s.cloud_pods.len() == 2
        })
        .await;
    assert!(snapshot
        .cloud_pods
        .iter()
        .all(|pod| pod.deployment == DeploymentId(1)));
    assert_eq!(harness.sim.deletes_served(), 1);
    assert!(harness.stats.get(counters::PLAN_STEPS_COMPLETED) >= 4);
}

#[tokio::test(start_paused = true)]
async fn drift_to_the_cloud_is_absorbed() {
    let sim = SimConnector::new(
        vec![edge_node(1, 2.0, 4.0), cloud_node(9)],
        vec![deployment(1, 1.0, 1.5, 1.0)],
    );
    let harness = start(sim, test_config()).await;

    let a = harness.sim.spawn_pod(DeploymentId(1));
    harness
        .wait_until(|s| s.edge_pods.len() == 1)
        .await;

    // Something outside the scheduler moves the replica to a cloud node.
    harness.sim.displace_pod(a, NodeId(9));

    let snapshot = harness
        .wait_until(|s| s.edge_pods.is_empty() && s.cloud_pods.len() == 1)
        .await;
    assert_eq!(snapshot.cloud_pods[0].id, a);
    assert!(harness.stats.get(counters::DRIFT_EVENTS) >= 1);
    assert_eq!(snapshot.edge_used, Resources::zeros(2));
}

#[tokio::test(start_paused = true)]
async fn suggestion_promotes_cloud_replicas() {
    let sim = SimConnector::new(
        vec![edge_node(1, 2.0, 4.0), cloud_node(9)],
        vec![deployment(1, 1.0, 1.5, 1.0)],
    );
    sim.seed_pod(DeploymentId(1), Some(NodeId(9)), PodStatus::Running);
    sim.seed_pod(DeploymentId(1), Some(NodeId(9)), PodStatus::Running);

    let config = SchedulerConfig {
        cloud_suggest_period: Duration::from_secs(5),
        ..test_config()
    };
    let harness = start(sim, config).await;

    let snapshot = harness
        .wait_until(|s| s.edge_pods.len() == 2 && s.cloud_pods.is_empty())
        .await;
    assert!(snapshot
        .edge_pods
        .iter()
        .all(|pod| pod.node == Some(NodeId(1))));
    assert!(harness.stats.get(counters::PLANS_REORDERING) >= 1);
    assert_eq!(harness.sim.deletes_served(), 2);
}

#[tokio::test(start_paused = true)]
async fn finished_replicas_leave_the_state() {
    let sim = SimConnector::new(
        vec![edge_node(1, 2.0, 4.0), cloud_node(9)],
        vec![deployment(1, 1.0, 1.5, 1.0)],
    );
    let harness = start(sim, test_config()).await;

    let a = harness.sim.spawn_pod(DeploymentId(1));
    harness.wait_until(|s| s.edge_pods.len() == 1).await;

    harness.sim.finish_pod(a);
    let snapshot = harness
        .wait_until(|s| s.edge_pods.is_empty() && s.cloud_pods.is_empty())
        .await;
    assert_eq!(snapshot.edge_used, Resources::zeros(2));
}
