use std::collections::HashMap;

use verge_cluster::EdgeConfig;
use verge_common::{NodeId, Pod, PodId, Resources, Result};

/// A feasible assignment of replicas to edge nodes, with the total
/// defragmentation gain it achieves (a sum of non-positive per-node terms:
/// the least free-capacity score sacrificed).
#[derive(Debug, Clone)]
pub struct Packing {
    pub gain: f64,
    pub assignment: HashMap<PodId, NodeId>,
}

impl Packing {
    fn empty() -> Self {
        Self {
            gain: 0.0,
            assignment: HashMap::new(),
        }
    }
}

/// Assign every replica in `pods` to an edge node without exceeding the
/// node's `free` vector, maximising the total defragmentation score of the
/// remaining free capacity. Returns `None` when no full assignment exists.
///
/// Each node receives a contiguous slice of the input order, which turns an
/// exponential bin-pack into an `O(nodes * pods^2)` dynamic program.
/// Callers sort `pods` by decreasing defragmentation weight when the
/// heuristic order matters; the contiguous-slice optimum then tracks the
/// unrestricted optimum closely.
pub fn fit_on_edge(
    pods: &[&Pod],
    config: &EdgeConfig,
    free: &HashMap<NodeId, Resources>,
    maxima: &Resources,
) -> Result<Option<Packing>> {
    let m = pods.len();
    if m == 0 {
        return Ok(Some(Packing::empty()));
    }
    let nodes = &config.nodes;
    let n = nodes.len();
    if n == 0 {
        return Ok(None);
    }

    let dim = config.resources.dim();
    let mut prefix = Vec::with_capacity(m + 1);
    prefix.push(Resources::zeros(dim));
    for pod in pods {
        let required = &config.deployment(pod.deployment)?.resources_required;
        prefix.push(prefix.last().expect("prefix is never empty").add(required));
    }
    let load = |from: usize, to: usize| prefix[to].sub(&prefix[from]);

    // dp[i][j]: best score with the first i nodes holding the first j pods.
    let mut dp = vec![vec![f64::NEG_INFINITY; m + 1]; n + 1];
    let mut parent = vec![vec![0usize; m + 1]; n + 1];
    dp[0][0] = 0.0;

    for i in 1..=n {
        let node_free = free
            .get(&nodes[i - 1].id)
            .cloned()
            .unwrap_or_else(|| Resources::zeros(dim));
        let base = node_free.defrag(maxima);

        for j in 0..=m {
            for k in 0..=j {
                if dp[i - 1][k] == f64::NEG_INFINITY {
                    continue;
                }
                let slice_load = load(k, j);
                if !slice_load.fits(&node_free) {
                    continue;
                }
                let gain = node_free.sub(&slice_load).defrag(maxima) - base;
                let candidate = dp[i - 1][k] + gain;
                if candidate > dp[i][j] {
                    dp[i][j] = candidate;
                    parent[i][j] = k;
                }
            }
        }
    }

    if dp[n][m] == f64::NEG_INFINITY {
        return Ok(None);
    }

    let mut assignment = HashMap::with_capacity(m);
    let mut j = m;
    for i in (1..=n).rev() {
        let k = parent[i][j];
        for pod in &pods[k..j] {
            assignment.insert(pod.id, nodes[i - 1].id);
        }
        j = k;
    }

    Ok(Some(Packing {
        gain: dp[n][m],
        assignment,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use verge_common::{Deployment, DeploymentId, PodStatus};

    fn setup(nodes: &[(u64, f64, f64)], deployments: &[(u64, f64, f64)]) -> EdgeConfig {
        let mut config = EdgeConfig {
            resources: Resources::zeros(2),
            ..Default::default()
        };
        for (id, cpu, mem) in nodes {
            let resources = Resources::new(vec![*cpu, *mem]);
            config.resources.add_assign(&resources);
            config.nodes.push(verge_common::Node {
                id: NodeId(*id),
                resources,
            });
        }
        for (id, cpu, mem) in deployments {
            config.deployments.insert(
                DeploymentId(*id),
                Deployment {
                    id: DeploymentId(*id),
                    resources_required: Resources::new(vec![*cpu, *mem]),
                    edge_share: 1.0,
                },
            );
        }
        config
    }

    fn pod(id: u64, deployment: u64) -> Pod {
        Pod::new(PodId(id), DeploymentId(deployment), PodStatus::Running)
    }

    fn full_free(config: &EdgeConfig) -> HashMap<NodeId, Resources> {
        config
            .nodes
            .iter()
            .map(|n| (n.id, n.resources.clone()))
            .collect()
    }

    #[test]
    fn empty_input_is_a_zero_packing() {
        let config = setup(&[(1, 2.0, 4.0)], &[]);
        let packing = fit_on_edge(&[], &config, &full_free(&config), &config.maximum_resources())
            .unwrap()
            .unwrap();
        assert_eq!(packing.gain, 0.0);
        assert!(packing.assignment.is_empty());
    }

    #[test]
    fn fits_two_pods_on_one_node() {
        let config = setup(&[(1, 2.0, 4.0)], &[(1, 1.0, 1.5), (2, 1.0, 2.0)]);
        let a = pod(10, 1);
        let b = pod(11, 2);
        let packing = fit_on_edge(
            &[&a, &b],
            &config,
            &full_free(&config),
            &config.maximum_resources(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(packing.assignment[&PodId(10)], NodeId(1));
        assert_eq!(packing.assignment[&PodId(11)], NodeId(1));
    }

    #[test]
    fn infeasible_returns_none() {
        let config = setup(&[(1, 1.0, 1.0)], &[(1, 2.0, 2.0)]);
        let a = pod(10, 1);
        let result = fit_on_edge(
            &[&a],
            &config,
            &full_free(&config),
            &config.maximum_resources(),
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn no_nodes_means_no_packing() {
        let config = setup(&[], &[(1, 1.0, 1.0)]);
        let a = pod(10, 1);
        let result = fit_on_edge(&[&a], &config, &HashMap::new(), &Resources::zeros(2)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn prefers_topping_up_the_fuller_node() {
        let config = setup(&[(1, 2.0, 2.0), (2, 2.0, 2.0)], &[(1, 1.0, 1.0)]);
        let mut free = full_free(&config);
        // Node 2 is already half full.
        free.insert(NodeId(2), Resources::new(vec![1.0, 1.0]));

        let a = pod(10, 1);
        let packing = fit_on_edge(&[&a], &config, &free, &config.maximum_resources())
            .unwrap()
            .unwrap();
        assert_eq!(packing.assignment[&PodId(10)], NodeId(2));
    }

    #[test]
    fn mapping_never_violates_capacity() {
        let config = setup(
            &[(1, 2.0, 4.0), (2, 2.0, 2.0)],
            &[(1, 1.0, 2.0), (2, 1.0, 1.0)],
        );
        let pods = [pod(10, 1), pod(11, 1), pod(12, 2), pod(13, 2)];
        let refs: Vec<&Pod> = pods.iter().collect();
        let free = full_free(&config);

        let packing = fit_on_edge(&refs, &config, &free, &config.maximum_resources())
            .unwrap()
            .expect("four pods fit on the two nodes");

        let mut used: HashMap<NodeId, Resources> = config
            .nodes
            .iter()
            .map(|n| (n.id, Resources::zeros(2)))
            .collect();
        for pod in &pods {
            let node = packing.assignment[&pod.id];
            used.get_mut(&node)
                .unwrap()
                .add_assign(&config.deployments[&pod.deployment].resources_required);
        }
        for node in &config.nodes {
            assert!(used[&node.id].fits(&node.resources));
        }
    }
}
