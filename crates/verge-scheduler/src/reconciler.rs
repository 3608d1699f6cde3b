//! The reconciling control loop.
//!
//! One task owns the cluster state and multiplexes everything: connector
//! events, the periodic buffer drain, the periodic cloud-to-edge
//! suggestion, the stuck-queue health check, state-query replies and
//! shutdown. Suggestions are computed off-loop on a clone and come back as
//! messages; every other algorithm call is synchronous on the live state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verge_alg::{decide, suggest_cloud_to_edge};
use verge_cluster::{ClusterSnapshot, ClusterState};
use verge_common::{DeploymentId, NodeTier, Pod, PodStatus, SchedulerConfig, Suggestion};
use verge_connector::{Connector, Event, EventKind, EventStream};

use crate::health::HealthSample;
use crate::metrics::{counters, StateHandle, Stats};
use crate::plan::{lower_decision, lower_suggestion, Expectation, Plan, PlanKind, PlanStep};

pub struct Reconciler<C: Connector> {
    state: ClusterState,
    connector: Arc<C>,
    config: SchedulerConfig,
    stats: Stats,
    cancel: CancellationToken,

    buffer: VecDeque<Pod>,
    expectations: VecDeque<Expectation>,
    expected_reorder: HashMap<DeploymentId, u32>,
    next_expectation_id: u32,
    last_health: Option<HealthSample>,

    state_query_rx: mpsc::Receiver<oneshot::Sender<ClusterSnapshot>>,
    suggestion_tx: mpsc::Sender<Suggestion>,
    suggestion_rx: mpsc::Receiver<Suggestion>,
}

impl<C: Connector + 'static> Reconciler<C> {
    pub fn new(
        connector: Arc<C>,
        config: SchedulerConfig,
        stats: Stats,
        cancel: CancellationToken,
    ) -> (Self, StateHandle) {
        let (state_query_tx, state_query_rx) = mpsc::channel(16);
        let (suggestion_tx, suggestion_rx) = mpsc::channel(4);
        let state = ClusterState::new(config.resource_count);

        (
            Self {
                state,
                connector,
                config,
                stats,
                cancel,
                buffer: VecDeque::new(),
                expectations: VecDeque::new(),
                expected_reorder: HashMap::new(),
                next_expectation_id: 0,
                last_health: None,
                state_query_rx,
                suggestion_tx,
                suggestion_rx,
            },
            StateHandle::new(state_query_tx),
        )
    }

    /// Discover the topology, resync the replica view, then loop until
    /// cancellation.
    pub async fn run(mut self) -> Result<()> {
        let mut events = self
            .connector
            .watch()
            .await
            .context("could not start watching scheduling events")?;

        self.discover().await?;
        self.resync().await;

        let mut flush_tick = tick(self.config.flush_period);
        let mut suggest_tick = tick(self.config.cloud_suggest_period);
        let mut health_tick = tick(self.config.health_check_period);

        info!("reconciler started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("reconciler cancelled");
                    return Ok(());
                }
                maybe_event = events.next() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("event stream ended, resyncing");
                        events = self.rewatch().await?;
                    }
                },
                _ = flush_tick.tick() => self.on_flush_tick().await,
                _ = suggest_tick.tick() => self.on_suggest_tick(),
                Some(suggestion) = self.suggestion_rx.recv() => {
                    self.on_suggestion(suggestion).await;
                }
                _ = health_tick.tick() => self.on_health_tick().await,
                Some(reply) = self.state_query_rx.recv() => {
                    let _ = reply.send(self.state.snapshot());
                }
            }
        }
    }

    async fn discover(&mut self) -> Result<()> {
        let nodes = self
            .connector
            .list_nodes()
            .await
            .context("connector could not find nodes")?;
        for (node, tier) in nodes {
            match tier {
                NodeTier::Edge => self.state.register_edge_node(node),
                NodeTier::Cloud => self.state.register_cloud_node(node),
                NodeTier::Ignore => debug!(node = %node.id, "ignoring unlabelled node"),
            }
        }

        let deployments = self
            .connector
            .list_deployments()
            .await
            .context("connector could not find deployments")?;
        for deployment in deployments {
            self.state.register_deployment(deployment);
        }

        info!(
            edge_nodes = self.state.edge.config.nodes.len(),
            cloud_nodes = self.state.cloud.nodes.len(),
            deployments = self.state.edge.config.deployments.len(),
            "cluster topology discovered"
        );
        Ok(())
    }

    async fn rewatch(&mut self) -> Result<EventStream> {
        let events = self
            .connector
            .watch()
            .await
            .context("could not re-establish the event watch")?;
        self.resync().await;
        Ok(events)
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: Event) {
        self.stats.incr(counters::EVENTS_TOTAL);
        debug!(kind = ?event.kind, pod = %event.pod.id, node = ?event.node, "event");

        if let Some(head) = self.expectations.front() {
            if head.step.matches(&event) {
                self.advance(event, true).await;
                return;
            }

            match event.kind {
                EventKind::PodCreated => self.unplanned_create(event).await,
                EventKind::PodChanged if self.is_status_change(&event) => {
                    self.absorb_status(&event);
                }
                _ => {
                    let error = verge_common::Error::UnexpectedEvent(event.pod.id);
                    warn!(%error, "event contradicts the head expectation, flushing");
                    self.stats.incr(counters::DRIFT_EVENTS);
                    self.absorb(&event);
                    self.flush("drift");
                    self.schedule_pass().await;
                }
            }
            return;
        }

        match event.kind {
            EventKind::PodCreated => self.buffer.push_back(event.pod),
            EventKind::PodChanged if self.is_status_change(&event) => self.absorb_status(&event),
            EventKind::PodChanged => {
                self.stats.incr(counters::DRIFT_EVENTS);
                self.absorb(&event);
                self.schedule_pass().await;
            }
            EventKind::PodDeleted => {
                self.state.remove(event.pod.id);
            }
        }
    }

    /// A pod-create that does not confirm the head expectation. During a
    /// reordering plan it may still be churn the plan budgeted for; an
    /// unaccounted pod means the plan is stale.
    async fn unplanned_create(&mut self, event: Event) {
        if self.mode() == Some(PlanKind::Reordering) {
            match self.expected_reorder.get_mut(&event.pod.deployment) {
                Some(budget) if *budget > 0 => {
                    *budget -= 1;
                    self.buffer.push_back(event.pod);
                }
                _ => {
                    warn!(
                        pod = %event.pod.id,
                        "pod not accounted for by the reordering plan, flushing"
                    );
                    self.buffer.push_back(event.pod);
                    self.flush("unplanned pod during reordering");
                    self.schedule_pass().await;
                }
            }
        } else {
            self.buffer.push_back(event.pod);
        }
    }

    /// Pop the head expectation, apply its follow-up, and fire the next
    /// step with the confirming event. `from_stream` marks real connector
    /// events (as opposed to buffer-matched synthetic ones), which consume
    /// reorder churn budget on their own.
    async fn advance(&mut self, event: Event, from_stream: bool) {
        let expectation = self
            .expectations
            .pop_front()
            .expect("advance is only called with a head expectation");

        if from_stream
            && expectation.kind == PlanKind::Reordering
            && event.kind == EventKind::PodCreated
        {
            if let Some(budget) = self.expected_reorder.get_mut(&event.pod.deployment) {
                *budget = budget.saturating_sub(1);
            }
        }

        if let Err(error) = expectation.step.after(&mut self.state, &event) {
            warn!(%error, "confirmed step's follow-up failed, flushing");
            self.flush("follow-up failure");
            return;
        }
        self.stats.incr(counters::PLAN_STEPS_COMPLETED);

        // A confirmed creation that no migrate-bind is waiting to consume
        // is a free replica; hand it to the buffer like any other arrival.
        let next_is_migrate_bind = matches!(
            self.expectations.front().map(|e| &e.step),
            Some(PlanStep::MigrateBind { .. })
        );
        if matches!(expectation.step, PlanStep::Create { .. }) && !next_is_migrate_bind {
            self.buffer.push_back(event.pod.clone());
        }

        let next_step = self.expectations.front().map(|e| e.step.clone());
        if let Some(step) = next_step {
            if let Err(error) = step
                .run(&self.state, self.connector.as_ref(), Some(&event))
                .await
            {
                warn!(%error, "plan step failed, flushing");
                self.flush("step failure");
                return;
            }
        }

        if self.expectations.is_empty() {
            self.expected_reorder.clear();
            self.last_health = None;
        }
    }

    fn mode(&self) -> Option<PlanKind> {
        self.expectations.front().map(|e| e.kind)
    }

    /// A change event that only carries a status transition for a replica
    /// we already track at that location.
    fn is_status_change(&self, event: &Event) -> bool {
        match self.state.pod(event.pod.id) {
            Some(current) => current.node == event.node,
            None => false,
        }
    }

    fn absorb_status(&mut self, event: &Event) {
        if event.pod.status == PodStatus::Finished {
            self.state.remove(event.pod.id);
        } else {
            self.state.set_status(event.pod.id, event.pod.status);
        }
    }

    /// Make the state reflect what the event says happened, wherever the
    /// replica actually went.
    fn absorb(&mut self, event: &Event) {
        self.state.remove(event.pod.id);
        if event.kind == EventKind::PodDeleted {
            return;
        }

        let pod = event.pod.clone();
        match event.node {
            Some(node) if self.state.is_edge_node(node) => {
                if let Err(error) = self.state.deploy_edge(pod.clone(), node) {
                    warn!(%error, "drifted replica does not fit its node, recording on cloud");
                    self.state.deploy_cloud(pod);
                }
            }
            Some(_) => self.state.deploy_cloud(pod),
            None => self.buffer.push_back(pod),
        }
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    async fn on_flush_tick(&mut self) {
        if self.expectations.is_empty() {
            self.schedule_pass().await;
        } else {
            self.match_buffer_against_head().await;
        }
    }

    /// A pod-create event may arrive before the scheduler forms the
    /// expectation that wants it; drain such strays from the buffer.
    async fn match_buffer_against_head(&mut self) {
        loop {
            let Some(head) = self.expectations.front() else {
                return;
            };
            let PlanStep::Create { deployment } = &head.step else {
                return;
            };
            let deployment = *deployment;
            let Some(position) = self
                .buffer
                .iter()
                .position(|pod| pod.deployment == deployment)
            else {
                return;
            };
            let pod = self
                .buffer
                .remove(position)
                .expect("position points into the buffer");
            debug!(pod = %pod.id, "buffered pod satisfies the awaited creation");
            let event = Event {
                kind: EventKind::PodCreated,
                pod,
                node: None,
            };
            self.advance(event, false).await;
        }
    }

    async fn schedule_pass(&mut self) {
        if !self.expectations.is_empty() || self.buffer.is_empty() {
            return;
        }

        let mut batch = Vec::new();
        while batch.len() < self.config.batch_size {
            let Some(pod) = self.buffer.pop_front() else {
                break;
            };
            batch.push(pod);
        }

        let decision = decide(&self.state, &batch, true, &self.config);
        if decision.score == f64::NEG_INFINITY {
            warn!(
                batch = batch.len(),
                "no feasible placement for the batch, dropping it"
            );
            return;
        }
        info!(
            score = decision.score,
            to_edge = decision.to_edge.len(),
            to_cloud = decision.to_cloud.len(),
            evicted = decision.evicted.len(),
            migrations = decision.migrations.len(),
            "placement decision"
        );

        let plan = lower_decision(
            &self.state,
            &decision,
            PlanKind::Placing,
            &mut self.next_expectation_id,
        );
        self.stats.incr(counters::PLANS_PLACING);
        self.install(plan, PlanKind::Placing).await;
    }

    fn on_suggest_tick(&mut self) {
        // A reorganisation is pointless while other work is in flight.
        if !self.expectations.is_empty() || self.state.cloud.pods.is_empty() {
            return;
        }

        let snapshot = self.state.clone();
        let config = self.config.clone();
        let tx = self.suggestion_tx.clone();
        tokio::spawn(async move {
            let suggestion = suggest_cloud_to_edge(&snapshot, &config);
            let _ = tx.send(suggestion).await;
        });
    }

    async fn on_suggestion(&mut self, suggestion: Suggestion) {
        if !self.expectations.is_empty() {
            self.stats.incr(counters::SUGGESTIONS_DROPPED);
            return;
        }
        if suggestion.cloud_to_edge.is_empty() || suggestion.decision.is_noop() {
            return;
        }
        info!(
            promotions = suggestion.cloud_to_edge.len(),
            score = suggestion.decision.score,
            "applying reorder suggestion"
        );

        let plan = lower_suggestion(&self.state, &suggestion, &mut self.next_expectation_id);
        self.stats.incr(counters::PLANS_REORDERING);
        self.install(plan, PlanKind::Reordering).await;
    }

    async fn on_health_tick(&mut self) {
        let sample = HealthSample::of(&self.expectations);
        let stuck = sample.indicates_stuck(self.last_health.as_ref());
        self.last_health = Some(sample);

        if stuck {
            warn!(
                queue = self.expectations.len(),
                "expectation queue made no progress, resyncing"
            );
            self.flush("stuck queue");
            self.resync().await;
        }
    }

    // ------------------------------------------------------------------
    // Plans and recovery
    // ------------------------------------------------------------------

    async fn install(&mut self, plan: Plan, kind: PlanKind) {
        if plan.steps.is_empty() {
            return;
        }
        if kind == PlanKind::Reordering {
            self.expected_reorder = plan.expected_creates;
        }
        self.expectations = plan.steps.into();
        self.last_health = None;

        let first_step = self
            .expectations
            .front()
            .map(|e| e.step.clone())
            .expect("installed plans are non-empty");
        if let Err(error) = first_step
            .run(&self.state, self.connector.as_ref(), None)
            .await
        {
            warn!(%error, "first plan step failed, flushing");
            self.flush("first step failure");
        }
    }

    fn flush(&mut self, reason: &str) {
        if self.expectations.is_empty() {
            return;
        }
        warn!(
            reason,
            dropped = self.expectations.len(),
            "flushing expectation queue"
        );
        self.expectations.clear();
        self.expected_reorder.clear();
        self.last_health = None;
        self.stats.incr(counters::EXPECTATION_FLUSHES);
    }

    /// Throw the replica view away and rebuild it from the connector,
    /// retrying with backoff until it works or we are cancelled.
    async fn resync(&mut self) {
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connector.resync().await {
                Ok(view) => {
                    self.state.reset_pods();
                    for pod in view.placed {
                        match pod.node {
                            Some(node) if self.state.is_edge_node(node) => {
                                if let Err(error) = self.state.deploy_edge(pod.clone(), node) {
                                    warn!(%error, "rediscovered replica does not fit, recording on cloud");
                                    self.state.deploy_cloud(pod);
                                }
                            }
                            _ => self.state.deploy_cloud(pod),
                        }
                    }
                    self.buffer = view.pending.into();
                    self.stats.incr(counters::RESYNCS);
                    info!(
                        edge = self.state.edge.pods.len(),
                        cloud = self.state.cloud.pods.len(),
                        pending = self.buffer.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "resynced the replica view"
                    );
                    self.schedule_pass().await;
                    return;
                }
                Err(error) => {
                    warn!(%error, "resync failed, retrying");
                    tokio::time::sleep(self.config.recover_retry_period).await;
                }
            }
        }
    }
}

/// An interval that waits a full period before its first tick and never
/// bursts to catch up.
fn tick(period: std::time::Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
