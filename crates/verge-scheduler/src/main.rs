use std::sync::Arc;

use anyhow::{bail, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use verge_common::{Deployment, DeploymentId, Node, NodeId, NodeTier, Resources};
use verge_connector::SimConnector;
use verge_scheduler::args::Args;
use verge_scheduler::metrics::{healthz_handler, metrics_handler, state_handler, AppState};
use verge_scheduler::{Reconciler, Stats};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    verge_common::telemetry::init_tracing("verge-scheduler", &args.log_format);
    info!("verge-scheduler starting...");

    let config = args.scheduler_config();

    let connector = match args.connector.as_str() {
        "sim" => Arc::new(demo_sim_connector()),
        other => bail!("connector kind {other} is not recognized (in-tree kinds: sim)"),
    };

    let stats = Stats::default();
    let cancel = CancellationToken::new();
    let (reconciler, state_query) =
        Reconciler::new(Arc::clone(&connector), config, stats.clone(), cancel.clone());

    // Status HTTP surface: liveness, counters, and a state snapshot that
    // goes through the reconciler's query channel.
    let app_state = Arc::new(AppState {
        stats,
        state_query,
    });
    let listen_addr = args.listen_addr.clone();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/healthz", get(healthz_handler))
            .route("/metrics", get(metrics_handler))
            .route("/state", get(state_handler))
            .with_state(app_state);

        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(error) => {
                error!(%error, "failed to bind status server on {listen_addr}");
                return;
            }
        };
        info!("status server listening on {listen_addr}");
        if let Err(error) = axum::serve(listener, app).await {
            error!(%error, "status server error");
        }
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    reconciler.run().await
}

/// The fixed testbed the `sim` connector serves: four deployments against
/// a three-node edge and one stand-in cloud node.
fn demo_sim_connector() -> SimConnector {
    let deployments = vec![
        Deployment {
            id: DeploymentId(1),
            resources_required: Resources::new(vec![1.0, 2.0]),
            edge_share: 0.5,
        },
        Deployment {
            id: DeploymentId(2),
            resources_required: Resources::new(vec![1.0, 1.0]),
            edge_share: 0.5,
        },
        Deployment {
            id: DeploymentId(3),
            resources_required: Resources::new(vec![0.5, 1.0]),
            edge_share: 1.0,
        },
        Deployment {
            id: DeploymentId(4),
            resources_required: Resources::new(vec![2.0, 4.0]),
            edge_share: 1.0,
        },
    ];

    let nodes = vec![
        (
            Node {
                id: NodeId(1),
                resources: Resources::new(vec![2.0, 4.0]),
            },
            NodeTier::Edge,
        ),
        (
            Node {
                id: NodeId(2),
                resources: Resources::new(vec![2.0, 2.0]),
            },
            NodeTier::Edge,
        ),
        (
            Node {
                id: NodeId(3),
                resources: Resources::new(vec![2.0, 3.0]),
            },
            NodeTier::Edge,
        ),
        (
            Node {
                id: NodeId(4),
                resources: Resources::new(vec![1e9, 1e9]),
            },
            NodeTier::Cloud,
        ),
    ];

    SimConnector::new(nodes, deployments)
}
