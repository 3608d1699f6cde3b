use std::collections::HashMap;

use verge_cluster::EdgeConfig;
use verge_common::{DeploymentId, Error, Pod, Result};

/// Value of the QoS curve exactly at the target edge fraction.
pub const SATURATION: f64 = 0.99;

const FRACTION_EPS: f64 = 1e-9;

/// Saturating per-deployment QoS of edge fraction `fraction` against the
/// deployment's target `target`.
///
/// At the target the curve saturates at 0.99; above it the remaining 0.01
/// is earned linearly up to 1.0 at a fully-edge deployment; below it the
/// value falls off as a square root, so the first missing edge replicas
/// hurt the most.
pub fn qos(fraction: f64, target: f64) -> f64 {
    if (fraction - target).abs() < FRACTION_EPS {
        return SATURATION;
    }

    if fraction > target {
        // target < 1 here: fraction > target rules out target = 1 past
        // the equality branch.
        SATURATION + (fraction - target) * (1.0 - SATURATION) / (1.0 - target)
    } else {
        0.8 * (fraction / target).sqrt()
    }
}

/// Replica membership bits for one snapshot: low bit is the tier, high bit
/// marks the proposed ("new") generation that overrides the pre-known one.
const ON_EDGE: u8 = 1;
const NEW_GENERATION: u8 = 1 << 1;

const PRE_CLOUD: u8 = 0;
const PRE_EDGE: u8 = ON_EDGE;
const NEW_CLOUD: u8 = NEW_GENERATION;
const NEW_EDGE: u8 = NEW_GENERATION | ON_EDGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentShare {
    pub on_edge: usize,
    pub total: usize,
}

impl DeploymentShare {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.on_edge as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct QosResult {
    /// Sum of per-deployment QoS over deployments with at least one replica.
    pub score: f64,
    pub per_deployment: HashMap<DeploymentId, DeploymentShare>,
}

/// Score a (possibly hypothetical) cluster arrangement.
///
/// A replica named in both a pre-known and a new bucket counts with its new
/// placement; a replica named on both tiers within one generation is an
/// inconsistent snapshot and fails. The inputs are never mutated.
pub fn evaluate<'a>(
    config: &EdgeConfig,
    pre_cloud: impl IntoIterator<Item = &'a Pod>,
    pre_edge: impl IntoIterator<Item = &'a Pod>,
    new_cloud: impl IntoIterator<Item = &'a Pod>,
    new_edge: impl IntoIterator<Item = &'a Pod>,
) -> Result<QosResult> {
    let mut placements: HashMap<DeploymentId, HashMap<_, u8>> = HashMap::new();

    let mut set_state = |state: u8, pod: &Pod| -> Result<()> {
        let by_pod = placements.entry(pod.deployment).or_default();
        if let Some(last) = by_pod.get(&pod.id).copied() {
            if last ^ state == ON_EDGE {
                return Err(Error::InconsistentPlacement(pod.id));
            }
        }
        by_pod.insert(pod.id, state);
        Ok(())
    };

    for pod in pre_edge {
        set_state(PRE_EDGE, pod)?;
    }
    for pod in pre_cloud {
        set_state(PRE_CLOUD, pod)?;
    }
    for pod in new_edge {
        set_state(NEW_EDGE, pod)?;
    }
    for pod in new_cloud {
        set_state(NEW_CLOUD, pod)?;
    }

    let mut score = 0.0;
    let mut per_deployment = HashMap::with_capacity(placements.len());

    for (deployment_id, by_pod) in placements {
        let deployment = config.deployment(deployment_id)?;
        let total = by_pod.len();
        let on_edge = by_pod.values().filter(|state| *state & ON_EDGE > 0).count();

        let share = DeploymentShare { on_edge, total };
        score += qos(share.fraction(), deployment.edge_share);
        per_deployment.insert(deployment_id, share);
    }

    Ok(QosResult {
        score,
        per_deployment,
    })
}
