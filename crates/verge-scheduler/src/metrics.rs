use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use tokio::sync::{mpsc, oneshot};

use verge_cluster::ClusterSnapshot;

/// Counter names used across the reconciler.
pub mod counters {
    pub const EVENTS_TOTAL: &str = "events_total";
    pub const PLAN_STEPS_COMPLETED: &str = "plan_steps_completed";
    pub const PLANS_PLACING: &str = "plans_placing";
    pub const PLANS_REORDERING: &str = "plans_reordering";
    pub const SUGGESTIONS_DROPPED: &str = "suggestions_dropped";
    pub const EXPECTATION_FLUSHES: &str = "expectation_flushes";
    pub const DRIFT_EVENTS: &str = "drift_events";
    pub const RESYNCS: &str = "resyncs";
}

/// Monotonic counters shared between the reconciler and the HTTP surface.
/// The only mutable state that leaves the reconciler's task; guarded by a
/// plain mutex.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<Mutex<BTreeMap<&'static str, u64>>>,
}

impl Stats {
    pub fn incr(&self, key: &'static str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &'static str, amount: u64) {
        let mut map = self.inner.lock().expect("stats mutex");
        *map.entry(key).or_insert(0) += amount;
    }

    pub fn get(&self, key: &'static str) -> u64 {
        self.inner
            .lock()
            .expect("stats mutex")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.inner.lock().expect("stats mutex").clone()
    }
}

/// Ask the reconciler for a clone of its state without touching the live
/// structure: requests go over an mpsc channel, replies over a oneshot.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<oneshot::Sender<ClusterSnapshot>>,
}

impl StateHandle {
    pub fn new(tx: mpsc::Sender<oneshot::Sender<ClusterSnapshot>>) -> Self {
        Self { tx }
    }

    pub async fn get(&self) -> Option<ClusterSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }
}

pub struct AppState {
    pub stats: Stats,
    pub state_query: StateHandle,
}

/// GET /metrics — Prometheus text exposition format.
pub async fn metrics_handler(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = String::new();
    for (key, value) in app.stats.snapshot() {
        body.push_str(&format!(
            "# TYPE verge_scheduler_{key} counter\nverge_scheduler_{key} {value}\n"
        ));
    }
    (axum::http::StatusCode::OK, body)
}

/// GET /healthz — simple liveness probe.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

/// GET /state — read-only snapshot of the cluster view.
pub async fn state_handler(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    match app.state_query.get().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "reconciler is not answering",
        )
            .into_response(),
    }
}
