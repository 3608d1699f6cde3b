//! Offline scenario replay.
//!
//! Feeds frames of replica arrivals and departures through either a
//! first-fit baseline or the full decision engine (plus two suggestion
//! passes per frame, the cadence the live scheduler approximates), and
//! reports aggregate QoS satisfaction and edge defragmentation per frame.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use verge_alg::{apply_decision, apply_suggestion, decide, suggest_cloud_to_edge};
use verge_cluster::ClusterState;
use verge_common::{Pod, SchedulerConfig};
use verge_testkit::{ClusterBuilder, DeploymentDesc, NodeDesc};

#[derive(Debug, Parser)]
struct Args {
    /// Path to the scenario JSON: an array of frames.
    #[arg(long)]
    scenario: PathBuf,

    /// `first-fit` or `qos`.
    #[arg(long, default_value = "qos")]
    algorithm: String,

    /// Where to write the JSON report; stdout when omitted.
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long, default_value = "text")]
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    new_pods: Vec<String>,
    #[serde(default)]
    delete_pods: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    qos: Vec<f64>,
    edge_usage: Vec<f64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    verge_common::telemetry::init_tracing("verge-sim", &args.log_format);

    let raw = fs::read(&args.scenario)
        .with_context(|| format!("could not read {}", args.scenario.display()))?;
    let frames: Vec<Frame> = serde_json::from_slice(&raw).context("malformed scenario")?;

    let mut builder = ClusterBuilder::new();
    builder.import_deployments(&[
        DeploymentDesc::new("A", 1.0, 2.0, 0.5),
        DeploymentDesc::new("B", 1.0, 1.0, 0.5),
        DeploymentDesc::new("C", 0.5, 1.0, 1.0),
        DeploymentDesc::new("D", 2.0, 4.0, 1.0),
    ]);
    let mut state = builder.cluster(
        &[
            (NodeDesc::new(2.0, 4.0), &[]),
            (NodeDesc::new(2.0, 2.0), &[]),
            (NodeDesc::new(2.0, 3.0), &[]),
        ],
        &[],
    );

    let config = SchedulerConfig::default();
    let mut report = Report::default();

    for (index, frame) in frames.iter().enumerate() {
        info!(
            frame = index,
            arrivals = frame.new_pods.len(),
            departures = frame.delete_pods.len(),
            "processing frame"
        );

        let names: Vec<&str> = frame.new_pods.iter().map(String::as_str).collect();
        let new_pods = builder.pods(&names);
        delete_pods(&mut state, &builder, &frame.delete_pods);

        match args.algorithm.as_str() {
            "first-fit" => first_fit(&mut state, new_pods),
            "qos" => {
                let decision = decide(&state, &new_pods, true, &config);
                apply_decision(&mut state, &decision);
                for _ in 0..2 {
                    let suggestion = suggest_cloud_to_edge(&state, &config);
                    apply_suggestion(&mut state, &suggestion);
                }
            }
            other => bail!("unknown algorithm {other}"),
        }

        state.assert_invariants();
        report.qos.push(satisfied_deployments(&state)?);
        report.edge_usage.push(
            state
                .edge
                .used
                .defrag(&state.edge.config.resources),
        );
    }

    let out = serde_json::to_vec_pretty(&report)?;
    match &args.report {
        Some(path) => {
            fs::write(path, out).with_context(|| format!("could not write {}", path.display()))?;
            info!(report = %path.display(), frames = report.qos.len(), "report written");
        }
        None => println!("{}", String::from_utf8_lossy(&out)),
    }

    Ok(())
}

/// Remove one replica per named deployment, preferring the edge copy,
/// the way the scenario format models departures.
fn delete_pods(state: &mut ClusterState, builder: &ClusterBuilder, names: &[String]) {
    for name in names {
        let deployment = builder.deployment_id(name);
        let victim = state
            .edge_pods()
            .chain(state.cloud_pods())
            .find(|pod| pod.deployment == deployment)
            .map(|pod| pod.id)
            .unwrap_or_else(|| panic!("no replica of {name} to delete"));
        state.remove(victim);
    }
}

/// The baseline: first edge node with room wins, cloud otherwise.
fn first_fit(state: &mut ClusterState, pods: Vec<Pod>) {
    for pod in pods {
        let required = state
            .edge
            .config
            .deployment(pod.deployment)
            .expect("scenario deployments are registered")
            .resources_required
            .clone();

        let free = state.free_by_node();
        let target = state
            .edge
            .config
            .nodes
            .iter()
            .map(|n| n.id)
            .find(|id| required.fits(&free[id]));

        match target {
            Some(node) => state
                .deploy_edge(pod, node)
                .expect("first-fit checked the capacity"),
            None => state.deploy_cloud(pod),
        }
    }
}

/// How many deployments meet their edge-share target outright.
fn satisfied_deployments(state: &ClusterState) -> Result<f64> {
    let result = verge_alg::evaluate(
        &state.edge.config,
        state.cloud_pods(),
        state.edge_pods(),
        std::iter::empty(),
        std::iter::empty(),
    )?;

    let mut satisfied = 0usize;
    for (deployment, share) in &result.per_deployment {
        let target = state.edge.config.deployment(*deployment)?.edge_share;
        if share.on_edge as f64 >= target * share.total as f64 {
            satisfied += 1;
        }
    }
    Ok(satisfied as f64)
}
