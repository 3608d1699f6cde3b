use verge_cluster::ClusterState;
use verge_common::{Error, Pod, Resources, Result};

use crate::qos::{evaluate, qos};

/// Choose incumbent edge replicas to offload so that `required` fits the
/// edge. Returns the replicas in eviction order; empty when the request
/// already fits. The live state is never mutated; the per-deployment
/// tallies are reworked on a private copy.
///
/// Ranking: eviction candidates are scored by the QoS lost per unit of
/// defragmentation weight reclaimed, so the cheapest-to-lose, heaviest
/// replicas go first. Ties keep placement order.
pub fn select_freed(state: &ClusterState, required: &Resources) -> Result<Vec<Pod>> {
    let edge_free = state.edge_free();
    if required.fits(&edge_free) {
        return Ok(Vec::new());
    }

    let capacity = &state.edge.config.resources;
    if required.exceeds_any(capacity) {
        return Err(Error::EdgeCapacityExceeded {
            requested: required.clone(),
            capacity: capacity.clone(),
        });
    }

    let config = &state.edge.config;
    let maxima = config.maximum_resources();
    let mut shares = evaluate(
        config,
        state.cloud_pods(),
        state.edge_pods(),
        std::iter::empty(),
        std::iter::empty(),
    )?
    .per_deployment;

    let mut deficit = required.sub_clamped(&edge_free);
    let mut candidates: Vec<&Pod> = state.edge_pods().collect();
    let mut freed = Vec::new();

    while !deficit.is_consumed() && !candidates.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (index, pod) in candidates.iter().enumerate() {
            let deployment = config.deployment(pod.deployment)?;
            let share = shares[&pod.deployment];
            let fraction = share.on_edge as f64 / share.total as f64;
            let after = (share.on_edge as f64 - 1.0) / share.total as f64;

            let weight = deployment
                .resources_required
                .defrag(&maxima)
                .max(f64::EPSILON);
            let score =
                (qos(after, deployment.edge_share) - qos(fraction, deployment.edge_share)) / weight;

            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((index, score)),
            }
        }

        let (index, _) = best.expect("candidates is non-empty");
        let pod = candidates.remove(index);
        let deployment = config.deployment(pod.deployment)?;
        deficit.sub_assign(&deployment.resources_required);
        if let Some(share) = shares.get_mut(&pod.deployment) {
            share.on_edge -= 1;
        }
        freed.push(pod.clone());
    }

    Ok(freed)
}
