//! An in-process cluster double.
//!
//! `SimConnector` keeps its own authoritative pod table and answers the
//! connector contract the way a real cluster would: binds and deletes are
//! acknowledged asynchronously through the watch stream, and every deleted
//! replica is replaced by a fresh pending one, which is what an upstream
//! replica controller does. Scenario tests drive drift and churn through
//! the injection handles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use verge_common::{Deployment, DeploymentId, Node, NodeId, NodeTier, Pod, PodId, PodStatus};

use crate::{Connector, Event, EventKind, EventStream, ResyncView};

#[derive(Clone)]
pub struct SimConnector {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<Event>,
}

struct Inner {
    nodes: Vec<(Node, NodeTier)>,
    deployments: Vec<Deployment>,
    pods: BTreeMap<PodId, Pod>,
    next_pod_id: u64,
    deletes_served: u64,
}

impl SimConnector {
    pub fn new(nodes: Vec<(Node, NodeTier)>, deployments: Vec<Deployment>) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                deployments,
                pods: BTreeMap::new(),
                next_pod_id: 1,
                deletes_served: 0,
            })),
            tx,
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// A new pending replica appears, as if the deployment scaled up.
    pub fn spawn_pod(&self, deployment: DeploymentId) -> PodId {
        let pod = {
            let mut inner = self.inner.lock().expect("sim state lock");
            let pod = Pod::new(PodId(inner.next_pod_id), deployment, PodStatus::Scheduled);
            inner.next_pod_id += 1;
            inner.pods.insert(pod.id, pod.clone());
            pod
        };
        let id = pod.id;
        self.emit(Event {
            kind: EventKind::PodCreated,
            pod,
            node: None,
        });
        id
    }

    /// Seed a replica without emitting any event: pre-existing state a
    /// resync should discover.
    pub fn seed_pod(&self, deployment: DeploymentId, node: Option<NodeId>, status: PodStatus) -> PodId {
        let mut inner = self.inner.lock().expect("sim state lock");
        let mut pod = Pod::new(PodId(inner.next_pod_id), deployment, status);
        inner.next_pod_id += 1;
        pod.node = node;
        let id = pod.id;
        inner.pods.insert(id, pod);
        id
    }

    /// The replica transitions to Running where it sits.
    pub fn mark_running(&self, pod: PodId) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("sim state lock");
            let Some(entry) = inner.pods.get_mut(&pod) else {
                return;
            };
            entry.status = PodStatus::Running;
            entry.clone()
        };
        let node = snapshot.node;
        self.emit(Event {
            kind: EventKind::PodChanged,
            pod: snapshot,
            node,
        });
    }

    /// The replica finishes and leaves the cluster (no replacement).
    pub fn finish_pod(&self, pod: PodId) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("sim state lock");
            let Some(mut entry) = inner.pods.remove(&pod) else {
                return;
            };
            entry.status = PodStatus::Finished;
            entry
        };
        let node = snapshot.node;
        self.emit(Event {
            kind: EventKind::PodChanged,
            pod: snapshot,
            node,
        });
    }

    /// Something outside the scheduler moves the replica: drift.
    pub fn displace_pod(&self, pod: PodId, node: NodeId) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("sim state lock");
            let Some(entry) = inner.pods.get_mut(&pod) else {
                return;
            };
            entry.node = Some(node);
            entry.clone()
        };
        self.emit(Event {
            kind: EventKind::PodChanged,
            pod: snapshot,
            node: Some(node),
        });
    }

    /// How many delete requests the scheduler has issued.
    pub fn deletes_served(&self) -> u64 {
        self.inner.lock().expect("sim state lock").deletes_served
    }

    pub fn pod_location(&self, pod: PodId) -> Option<Option<NodeId>> {
        self.inner
            .lock()
            .expect("sim state lock")
            .pods
            .get(&pod)
            .map(|p| p.node)
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn list_nodes(&self) -> Result<Vec<(Node, NodeTier)>> {
        Ok(self.inner.lock().expect("sim state lock").nodes.clone())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.inner.lock().expect("sim state lock").deployments.clone())
    }

    async fn resync(&self) -> Result<ResyncView> {
        let inner = self.inner.lock().expect("sim state lock");
        let mut view = ResyncView::default();
        for pod in inner.pods.values() {
            if pod.node.is_some() {
                view.placed.push(pod.clone());
            } else {
                view.pending.push(pod.clone());
            }
        }
        Ok(view)
    }

    async fn bind(&self, pod: PodId, node: NodeId) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock().expect("sim state lock");
            if !inner.nodes.iter().any(|(n, _)| n.id == node) {
                bail!("no node {node} in the cluster");
            }
            let Some(entry) = inner.pods.get_mut(&pod) else {
                bail!("no pod {pod} in the cluster");
            };
            entry.node = Some(node);
            // The double compresses scheduling and startup: a bound
            // replica reports Running straight away.
            entry.status = PodStatus::Running;
            entry.clone()
        };
        self.emit(Event {
            kind: EventKind::PodChanged,
            pod: snapshot,
            node: Some(node),
        });
        Ok(())
    }

    async fn delete(&self, pod: PodId) -> Result<bool> {
        let (snapshot, replacement) = {
            let mut inner = self.inner.lock().expect("sim state lock");
            inner.deletes_served += 1;
            let Some(entry) = inner.pods.remove(&pod) else {
                return Ok(false);
            };
            // The upstream controller replaces the lost replica.
            let replacement = Pod::new(
                PodId(inner.next_pod_id),
                entry.deployment,
                PodStatus::Scheduled,
            );
            inner.next_pod_id += 1;
            inner.pods.insert(replacement.id, replacement.clone());
            (entry, replacement)
        };

        self.emit(Event {
            kind: EventKind::PodDeleted,
            pod: snapshot,
            node: None,
        });
        self.emit(Event {
            kind: EventKind::PodCreated,
            pod: replacement,
            node: None,
        });
        Ok(true)
    }

    async fn watch(&self) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|msg| msg.ok());
        Ok(Box::pin(stream))
    }
}
