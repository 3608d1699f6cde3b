use tracing::warn;

use verge_cluster::ClusterState;
use verge_common::{Decision, Pod, Resources, SchedulerConfig};

use crate::free::select_freed;
use crate::migrate::plan_migrations;
use crate::qos::evaluate;

/// Pick the best edge/cloud split for a batch of new replicas.
///
/// Every one of the `2^batch` partitions is scored: the edge-bound subset
/// is granted evictions and in-edge moves when `can_migrate` allows,
/// otherwise it must fit the free edge as-is. Each surviving partition is
/// scored by evaluating the hypothetical cluster it produces, and the
/// highest score wins. Infeasible partitions are skipped, never fatal; if
/// none survives, the zero decision (score `-inf`) comes back.
pub fn decide(
    state: &ClusterState,
    batch: &[Pod],
    can_migrate: bool,
    config: &SchedulerConfig,
) -> Decision {
    let edge_config = &state.edge.config;
    let edge_free = state.edge_free();
    let mut best = Decision::none();

    for mask in 0u32..(1 << batch.len()) {
        let mut to_edge = Vec::new();
        let mut to_cloud = Vec::new();
        for (i, pod) in batch.iter().enumerate() {
            if mask & (1 << i) > 0 {
                to_edge.push(pod.clone());
            } else {
                to_cloud.push(pod.clone());
            }
        }

        let mut required = Resources::zeros(edge_free.dim());
        let mut known = true;
        for pod in &to_edge {
            match edge_config.deployment(pod.deployment) {
                Ok(deployment) => required.add_assign(&deployment.resources_required),
                Err(_) => {
                    known = false;
                    break;
                }
            }
        }
        if !known {
            continue;
        }

        let (evicted, migrations) = if can_migrate {
            let evicted = match select_freed(state, &required) {
                Ok(evicted) => evicted,
                Err(err) if err.is_infeasible() => continue,
                Err(err) => {
                    warn!(error = %err, "skipping partition after selector failure");
                    continue;
                }
            };
            // Moves are only worth their churn when an eviction disturbed
            // the packing; an untouched edge stays put.
            let migrations = if evicted.is_empty() {
                Vec::new()
            } else {
                match plan_migrations(state, &evicted, config.maximum_migrations) {
                    Ok(migrations) => migrations,
                    Err(err) => {
                        warn!(error = %err, "skipping partition after migration planning failure");
                        continue;
                    }
                }
            };
            (evicted, migrations)
        } else {
            if required.exceeds_any(&edge_free) {
                continue;
            }
            (Vec::new(), Vec::new())
        };

        // Hypothetical next state: evicted replicas join the cloud bucket
        // and override their pre-known edge placement.
        let score = match evaluate(
            edge_config,
            state.cloud_pods(),
            state.edge_pods(),
            evicted.iter().chain(&to_cloud),
            to_edge.iter(),
        ) {
            Ok(result) => result.score,
            Err(err) => {
                warn!(error = %err, "skipping partition after scoring failure");
                continue;
            }
        };

        if score > best.score {
            best = Decision {
                score,
                evicted,
                to_edge,
                to_cloud,
                migrations,
            };
        }
    }

    // Without a triggering change there is nothing to justify disturbance.
    if best.evicted.is_empty() && best.to_edge.is_empty() && best.to_cloud.is_empty() {
        best.migrations.clear();
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_testkit::{ClusterBuilder, DeploymentDesc, NodeDesc};

    fn builder() -> ClusterBuilder {
        let mut builder = ClusterBuilder::new();
        builder.import_deployments(&[
            DeploymentDesc::new("A", 1.0, 1.5, 1.0),
            DeploymentDesc::new("B", 1.0, 2.0, 1.0),
        ]);
        builder
    }

    #[test]
    fn empty_batch_is_a_zero_decision() {
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(2.0, 4.0), &["A"])], &[]);
        let decision = decide(&state, &[], true, &SchedulerConfig::default());
        assert!(decision.is_noop());
        assert!(decision.migrations.is_empty());
    }

    #[test]
    fn fills_an_empty_edge() {
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(2.0, 4.0), &[])], &[]);
        let batch = builder.pods(&["A", "B"]);

        let decision = decide(&state, &batch, true, &SchedulerConfig::default());
        assert_eq!(decision.to_edge.len(), 2);
        assert!(decision.to_cloud.is_empty());
        assert!(decision.evicted.is_empty());
    }

    #[test]
    fn no_edge_nodes_sends_everything_to_cloud() {
        let mut builder = builder();
        let state = builder.cluster(&[], &[]);
        let batch = builder.pods(&["A", "B"]);

        let decision = decide(&state, &batch, true, &SchedulerConfig::default());
        assert!(decision.to_edge.is_empty());
        assert_eq!(decision.to_cloud.len(), 2);
    }

    #[test]
    fn without_migrations_an_overfull_partition_is_skipped() {
        let mut builder = builder();
        let state = builder.cluster(&[(NodeDesc::new(1.0, 2.0), &["B"])], &[]);
        let batch = builder.pods(&["A"]);

        let decision = decide(&state, &batch, false, &SchedulerConfig::default());
        assert!(decision.to_edge.is_empty());
        assert_eq!(decision.to_cloud.len(), 1);
        assert!(decision.evicted.is_empty());
    }
}
