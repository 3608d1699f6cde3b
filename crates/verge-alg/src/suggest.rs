use tracing::warn;

use verge_cluster::ClusterState;
use verge_common::{Pod, SchedulerConfig, Suggestion};

use crate::decision::decide;
use crate::qos::{evaluate, qos};

/// Periodically pick cloud replicas whose promotion to the edge buys the
/// most QoS per unit of packing weight, then let the decision engine place
/// them (with evictions and in-edge moves allowed).
///
/// Picking stops at the configured offload cap, when nothing fits the
/// shrinking free capacity, or at the first candidate whose promotion no
/// longer gains any QoS.
pub fn suggest_cloud_to_edge(state: &ClusterState, config: &SchedulerConfig) -> Suggestion {
    let edge_config = &state.edge.config;

    let mut shares = match evaluate(
        edge_config,
        state.cloud_pods(),
        state.edge_pods(),
        std::iter::empty(),
        std::iter::empty(),
    ) {
        Ok(result) => result.per_deployment,
        Err(err) => {
            warn!(error = %err, "cannot score the cluster, skipping suggestion");
            return Suggestion::empty();
        }
    };

    let maxima = edge_config.maximum_resources();
    let mut available = state.edge_free();
    let mut candidates: Vec<&Pod> = state.cloud_pods().collect();
    let mut picks: Vec<Pod> = Vec::new();

    while picks.len() < config.maximum_cloud_offload {
        let mut best: Option<(usize, f64, f64)> = None;
        for (index, pod) in candidates.iter().enumerate() {
            let Ok(deployment) = edge_config.deployment(pod.deployment) else {
                continue;
            };
            if deployment.resources_required.exceeds_any(&available) {
                continue;
            }

            let share = shares[&pod.deployment];
            let fraction = share.on_edge as f64 / share.total as f64;
            let promoted = (share.on_edge as f64 + 1.0) / share.total as f64;
            let gain =
                qos(promoted, deployment.edge_share) - qos(fraction, deployment.edge_share);
            let weight = deployment
                .resources_required
                .defrag(&maxima)
                .max(f64::EPSILON);
            let score = gain / weight;

            match best {
                Some((_, best_score, _)) if score <= best_score => {}
                _ => best = Some((index, score, gain)),
            }
        }

        let Some((index, _, gain)) = best else {
            break;
        };
        if gain <= 0.0 {
            break;
        }

        let pod = candidates.remove(index);
        let deployment = edge_config
            .deployment(pod.deployment)
            .expect("picked candidates have registered deployments");
        available.sub_assign(&deployment.resources_required);
        if let Some(share) = shares.get_mut(&pod.deployment) {
            share.on_edge += 1;
        }
        picks.push(pod.clone());
    }

    if picks.is_empty() {
        return Suggestion::empty();
    }

    let decision = decide(state, &picks, true, config);
    Suggestion {
        cloud_to_edge: picks,
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_testkit::{ClusterBuilder, DeploymentDesc, NodeDesc};

    fn builder() -> ClusterBuilder {
        let mut builder = ClusterBuilder::new();
        builder.import_deployments(&[
            DeploymentDesc::new("A", 1.0, 2.0, 1.0),
            DeploymentDesc::new("B", 1.0, 1.0, 0.0),
        ]);
        builder
    }

    #[test]
    fn promotes_the_underserved_deployment() {
        // Capacity for exactly one promotion: the edge-hungry A wins it.
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(1.0, 2.0), &[])], &["A", "B"]);

        let suggestion = suggest_cloud_to_edge(&state, &SchedulerConfig::default());
        assert_eq!(suggestion.cloud_to_edge.len(), 1);
        assert_eq!(
            suggestion.cloud_to_edge[0].deployment,
            builder.deployment_id("A"),
            "the edge-hungry deployment gains the most from promotion"
        );
        assert_eq!(suggestion.decision.to_edge.len(), 1);
    }

    #[test]
    fn zero_cap_suggests_nothing() {
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(2.0, 4.0), &[])], &["A"]);

        let config = SchedulerConfig {
            maximum_cloud_offload: 0,
            ..Default::default()
        };
        let suggestion = suggest_cloud_to_edge(&state, &config);
        assert!(suggestion.cloud_to_edge.is_empty());
    }

    #[test]
    fn picks_follow_the_gain_ordering() {
        // Room for both, but A (share 1.0) must be picked before B
        // (share 0.0, whose promotion only earns the above-target trickle).
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(2.0, 4.0), &[])], &["B", "A"]);

        let suggestion = suggest_cloud_to_edge(&state, &SchedulerConfig::default());
        assert_eq!(suggestion.cloud_to_edge.len(), 2);
        assert_eq!(
            suggestion.cloud_to_edge[0].deployment,
            builder.deployment_id("A")
        );
    }

    #[test]
    fn stops_when_nothing_fits() {
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(0.5, 0.5), &[])], &["A", "A"]);

        let suggestion = suggest_cloud_to_edge(&state, &SchedulerConfig::default());
        assert!(suggestion.cloud_to_edge.is_empty());
    }
}
