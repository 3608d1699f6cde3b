//! Speculative application of decisions and suggestions.
//!
//! The reconciler realises a decision through connector round-trips; the
//! simulator and the scenario tests want the end state directly. These
//! helpers mutate a cluster state the way a fully-confirmed plan would,
//! and panic on assumptions a decision is supposed to guarantee.

use tracing::warn;

use verge_cluster::ClusterState;
use verge_common::{Decision, Pod, Suggestion};

use crate::pack::fit_on_edge;

/// Sort new edge replicas the way the packer expects: heaviest
/// defragmentation weight first.
pub fn presort_for_packing(state: &ClusterState, pods: &mut [Pod]) {
    let maxima = state.edge.config.maximum_resources();
    let weight = |pod: &Pod| {
        state
            .edge
            .config
            .deployment(pod.deployment)
            .map(|d| d.resources_required.defrag(&maxima))
            .unwrap_or(0.0)
    };
    pods.sort_by(|a, b| weight(b).total_cmp(&weight(a)));
}

pub fn apply_decision(state: &mut ClusterState, decision: &Decision) {
    for pod in &decision.evicted {
        let mut pod = state
            .pod(pod.id)
            .unwrap_or_else(|| panic!("evicted pod {} is not in the cluster", pod.id))
            .clone();
        assert!(state.remove(pod.id), "evicted pod vanished mid-apply");
        pod.node = None;
        state.deploy_cloud(pod);
    }

    for migration in &decision.migrations {
        let pod = state
            .pod(migration.pod)
            .unwrap_or_else(|| panic!("migrating pod {} is not in the cluster", migration.pod))
            .clone();
        assert!(state.remove(pod.id), "migrating pod vanished mid-apply");
        state
            .deploy_edge(pod, migration.node)
            .expect("a planned migration fits its target node");
    }

    for pod in &decision.to_cloud {
        state.deploy_cloud(pod.clone());
    }

    deploy_batch_on_edge(state, &decision.to_edge);
}

/// Promote the suggested cloud replicas and realise the decision that
/// places them. Picks the inner decision left on the cloud stay where they
/// already are.
pub fn apply_suggestion(state: &mut ClusterState, suggestion: &Suggestion) {
    let decision = &suggestion.decision;
    if decision.is_noop() {
        return;
    }

    for pod in &decision.to_edge {
        assert!(
            state.remove(pod.id),
            "promoted pod {} is not on the cloud",
            pod.id
        );
    }

    for pod in &decision.evicted {
        let mut pod = state
            .pod(pod.id)
            .unwrap_or_else(|| panic!("evicted pod {} is not in the cluster", pod.id))
            .clone();
        assert!(state.remove(pod.id), "evicted pod vanished mid-apply");
        pod.node = None;
        state.deploy_cloud(pod);
    }

    for migration in &decision.migrations {
        let pod = state
            .pod(migration.pod)
            .unwrap_or_else(|| panic!("migrating pod {} is not in the cluster", migration.pod))
            .clone();
        assert!(state.remove(pod.id), "migrating pod vanished mid-apply");
        state
            .deploy_edge(pod, migration.node)
            .expect("a planned migration fits its target node");
    }

    deploy_batch_on_edge(state, &decision.to_edge);
}

fn deploy_batch_on_edge(state: &mut ClusterState, pods: &[Pod]) {
    if pods.is_empty() {
        return;
    }

    let mut ordered: Vec<Pod> = pods.to_vec();
    presort_for_packing(state, &mut ordered);

    let maxima = state.edge.config.maximum_resources();
    let free = state.free_by_node();
    let refs: Vec<&Pod> = ordered.iter().collect();
    let packing = fit_on_edge(&refs, &state.edge.config, &free, &maxima)
        .expect("batch deployments are registered");

    match packing {
        Some(packing) => {
            for pod in ordered {
                let node = packing.assignment[&pod.id];
                state
                    .deploy_edge(pod, node)
                    .expect("the packing respects node capacities");
            }
        }
        None => {
            warn!("edge batch no longer fits, falling back to cloud");
            for pod in ordered {
                state.deploy_cloud(pod);
            }
        }
    }
}
