use std::collections::{HashMap, HashSet};

use verge_cluster::ClusterState;
use verge_common::{Migration, Pod, PodId, Resources, Result};

use crate::pack::fit_on_edge;

const IMPROVEMENT_EPS: f64 = 1e-9;

/// Search for in-edge moves that improve the packing after `freed` replicas
/// leave the edge, bounded by the `budget` on simultaneous moves.
///
/// Every subset of the remaining edge replicas up to the budget is tried in
/// every order (the order steers the prefix packer), each time re-packing
/// over the whole edge with the subset notionally lifted off its nodes.
/// Returns the best strict improvement over leaving things where they are,
/// or nothing. Moves that land on the replica's current node are dropped.
pub fn plan_migrations(
    state: &ClusterState,
    freed: &[Pod],
    budget: usize,
) -> Result<Vec<Migration>> {
    if budget == 0 {
        return Ok(Vec::new());
    }

    let config = &state.edge.config;
    let maxima = config.maximum_resources();

    let freed_ids: HashSet<PodId> = freed.iter().map(|p| p.id).collect();
    let remaining: Vec<&Pod> = state
        .edge_pods()
        .filter(|p| !freed_ids.contains(&p.id))
        .collect();
    if remaining.is_empty() {
        return Ok(Vec::new());
    }

    // Free capacity once the freed replicas are gone.
    let mut base_free = state.free_by_node();
    for pod in freed {
        let required = &config.deployment(pod.deployment)?.resources_required;
        if let Some(node) = pod.node {
            if let Some(free) = base_free.get_mut(&node) {
                free.add_assign(required);
            }
        }
    }

    let total_defrag = |free: &HashMap<_, Resources>| -> f64 {
        free.values().map(|f| f.defrag(&maxima)).sum()
    };
    let baseline = total_defrag(&base_free);

    let mut best_total = baseline;
    let mut best_moves: Vec<Migration> = Vec::new();

    for combo in combinations(remaining.len(), budget.min(remaining.len())) {
        // Lift the chosen replicas off their nodes.
        let mut lifted_free = base_free.clone();
        for &index in &combo {
            let pod = remaining[index];
            let required = &config.deployment(pod.deployment)?.resources_required;
            if let Some(node) = pod.node {
                if let Some(free) = lifted_free.get_mut(&node) {
                    free.add_assign(required);
                }
            }
        }
        let lifted_total = total_defrag(&lifted_free);

        for order in permutations(&combo) {
            let ordered: Vec<&Pod> = order.iter().map(|&i| remaining[i]).collect();
            let Some(packing) = fit_on_edge(&ordered, config, &lifted_free, &maxima)? else {
                continue;
            };

            let total = lifted_total + packing.gain;
            if total > best_total + IMPROVEMENT_EPS {
                best_total = total;
                best_moves = ordered
                    .iter()
                    .filter_map(|pod| {
                        let target = packing.assignment[&pod.id];
                        (pod.node != Some(target)).then_some(Migration {
                            pod: pod.id,
                            node: target,
                        })
                    })
                    .collect();
            }
        }
    }

    Ok(best_moves)
}

/// All index subsets of `0..len` with between 1 and `max_size` elements.
fn combinations(len: usize, max_size: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for size in 1..=max_size {
        choose(len, size, 0, &mut current, &mut out);
    }
    out
}

fn choose(
    len: usize,
    left: usize,
    start: usize,
    current: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if left == 0 {
        out.push(current.clone());
        return;
    }
    for index in start..=len.saturating_sub(left) {
        current.push(index);
        choose(len, left - 1, index + 1, current, out);
        current.pop();
    }
}

/// Every ordering of `items`, by Heap's algorithm.
fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    let mut arr = items.to_vec();
    let mut out = Vec::new();
    heap(arr.len(), &mut arr, &mut out);
    out
}

fn heap(n: usize, arr: &mut [usize], out: &mut Vec<Vec<usize>>) {
    if n <= 1 {
        out.push(arr.to_vec());
        return;
    }
    for i in 0..n {
        heap(n - 1, arr, out);
        if n % 2 == 1 {
            arr.swap(i, n - 1);
        } else {
            arr.swap(0, n - 1);
        }
    }
}
