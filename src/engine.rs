//! The engine loop: drains the add/kill queues, advances every active
//! node through the planner, and dispatches executor work.
//!
//! Each tick:
//!
//! 1. drain queued kill sets (one transaction per set),
//! 2. drain queued add batches (equivalence-deduplicating left to right),
//! 3. advance every in-progress node: plan, dispatch, fold the result
//!    back into the history, commit,
//! 4. sleep until the next tick or an external wake-up.
//!
//! All persistent effects are transactional and the queues are durable,
//! so re-running a tick after a crash converges to the same result.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::cache::NodeCache;
use crate::executor::{ConditionEvaluator, ExecutorRegistry};
use crate::history::{ActivationReason, HistoryError, SimpleStatus, StateTag};
use crate::model::{Node, NodeId};
use crate::planner::{
    Action, DepsOutcome, Progress, apply_check_process, apply_deps, apply_eval, apply_finish,
    apply_inline, apply_kill, apply_start, escalate_exhausted, plan,
};
use crate::store::{Store, StoreError};

/// Default fan-out for executor calls within one tick.
pub const DEFAULT_CONCURRENT_STEPS: usize = 4;

/// Default retry budget per logical state.
pub const DEFAULT_MAX_SUCCESSIVE_ATTEMPTS: u32 = 10;

/// Default pause between ticks while work is in flight.
pub const DEFAULT_BLOCK_STEP_TIME: Duration = Duration::from_secs(3);

/// Default pause when fully idle (interrupted by queue wake-ups).
pub const DEFAULT_MAX_BLOCKING_TIME: Duration = Duration::from_secs(300);

// ============================================================================
// Config & errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrent_steps: usize,
    pub max_successive_attempts: u32,
    pub block_step_time: Duration,
    pub max_blocking_time: Duration,
    pub read_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrent_steps: DEFAULT_CONCURRENT_STEPS,
            max_successive_attempts: DEFAULT_MAX_SUCCESSIVE_ATTEMPTS,
            block_step_time: DEFAULT_BLOCK_STEP_TIME,
            max_blocking_time: DEFAULT_MAX_BLOCKING_TIME,
            read_only: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("history error: {0}")]
    History(#[from] HistoryError),
    #[error("rejected submission: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepReport {
    pub killed: usize,
    pub added: usize,
    pub advanced: usize,
    pub node_errors: usize,
}

// ============================================================================
// Handle
// ============================================================================

/// Client-side handle: queue work and wake the loop. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    store: Arc<Store>,
    wake: Arc<Notify>,
    read_only: bool,
}

impl EngineHandle {
    /// Validate and enqueue a batch of nodes as one equivalence unit.
    pub async fn submit(&self, nodes: Vec<Node>) -> EngineResult<Vec<NodeId>> {
        if self.read_only {
            return Err(EngineError::Rejected("engine is read-only".to_string()));
        }
        if nodes.is_empty() {
            return Err(EngineError::Rejected("empty batch".to_string()));
        }
        for node in &nodes {
            node.history
                .check_invariants()
                .map_err(|e| EngineError::Rejected(format!("node {}: {e}", node.id)))?;
            if !matches!(node.history.tag(), StateTag::Passive | StateTag::Active) {
                return Err(EngineError::Rejected(format!(
                    "node {} submitted in state {}",
                    node.id,
                    node.history.tag()
                )));
            }
        }
        let ids = nodes.iter().map(|n| n.id.clone()).collect();
        self.store.queue_adds(&nodes).await?;
        self.wake.notify_one();
        Ok(ids)
    }

    /// Enqueue a set of ids to kill.
    pub async fn kill(&self, ids: Vec<NodeId>) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::Rejected("engine is read-only".to_string()));
        }
        if ids.is_empty() {
            return Ok(());
        }
        self.store.queue_kills(&ids).await?;
        self.wake.notify_one();
        Ok(())
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    store: Arc<Store>,
    cache: Arc<NodeCache>,
    registry: Arc<ExecutorRegistry>,
    evaluator: Arc<dyn ConditionEvaluator>,
    config: EngineConfig,
    wake: Arc<Notify>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<NodeCache>,
        registry: Arc<ExecutorRegistry>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            evaluator,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            store: Arc::clone(&self.store),
            wake: Arc::clone(&self.wake),
            read_only: self.config.read_only,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Run ticks until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        info!(
            concurrent_steps = self.config.concurrent_steps,
            max_successive_attempts = self.config.max_successive_attempts,
            read_only = self.config.read_only,
            "engine starting"
        );
        self.cache.warm(&self.store).await?;
        self.store.emit_started();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let busy = match self.step().await {
                Ok(report) => {
                    if report.killed + report.added + report.advanced > 0 {
                        debug!(
                            killed = report.killed,
                            added = report.added,
                            advanced = report.advanced,
                            node_errors = report.node_errors,
                            "tick complete"
                        );
                    }
                    report.advanced > 0
                }
                Err(EngineError::Store(e)) if e.is_recoverable() => {
                    warn!(error = %e, "tick failed on a transient store error, retrying next tick");
                    true
                }
                Err(e) => return Err(e),
            };

            let pause = if busy || self.store.queues_pending().await.unwrap_or(true) {
                self.config.block_step_time
            } else {
                self.config.max_blocking_time
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("engine stopped");
        Ok(())
    }

    /// One tick. Exposed for tests and for single-shot embedding.
    pub async fn step(&self) -> EngineResult<StepReport> {
        if self.config.read_only {
            return Ok(StepReport::default());
        }
        let mut report = StepReport::default();

        let killed = self.store.drain_kills().await?;
        report.killed = killed.len();
        for id in &killed {
            self.cache.evict(id).await;
        }

        let batches = self.store.drain_adds().await?;
        for batch in &batches {
            report.added += batch.len();
            for stored in batch {
                self.cache.put(stored.clone()).await;
            }
        }

        let actives = self.store.active_nodes().await?;
        report.advanced = actives.len();
        let outcomes: Vec<EngineResult<()>> = stream::iter(actives)
            .map(|node| self.advance_node(node))
            .buffer_unordered(self.config.concurrent_steps.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            if let Err(e) = outcome {
                report.node_errors += 1;
                match &e {
                    EngineError::Store(StoreError::Parse { .. }) => {
                        // Fatal for the affected record only: log and skip
                        // this node's tick.
                        error!(error = %e, "serialization failure, skipping node this tick");
                    }
                    _ => error!(error = %e, "node advance failed"),
                }
            }
        }
        Ok(report)
    }

    /// Step one node until it makes no more forward progress this tick.
    async fn advance_node(&self, mut node: Node) -> EngineResult<()> {
        let step_budget = self.config.max_successive_attempts.max(1);
        for _ in 0..step_budget {
            let action = plan(&node);
            let (next, progress) = match action {
                Action::DoNothing { then: None } => break,
                Action::DoNothing { then: Some(tag) } => apply_inline(&node, tag)?,
                Action::Activate { ids } => {
                    let activated = self.activate_all(&node.id, &ids).await?;
                    apply_finish(&node, &activated)?
                }
                Action::CheckDeps => {
                    let outcome = self.check_deps(&node).await?;
                    apply_deps(&node, outcome)?
                }
                Action::StartRunning(book) => {
                    let result = self.registry.start(&book.plugin, &node).await;
                    apply_start(&node, result)?
                }
                Action::EvalCondition { condition, phase } => {
                    let result = self
                        .registry
                        .eval_condition(self.evaluator.as_ref(), &condition)
                        .await;
                    apply_eval(&node, phase, result)?
                }
                Action::CheckProcess(book) => {
                    let result = self.registry.check(&book).await;
                    apply_check_process(&node, result)?
                }
                Action::Kill(book) => {
                    let result = self.registry.kill(&book).await;
                    apply_kill(&node, result)?
                }
            };

            let moved = next.history.len() > node.history.len();
            node = next;
            if moved {
                self.cache.update(&self.store, &node).await?;
            }

            match progress {
                Progress::Changed => continue,
                Progress::Unchanged => {
                    if let Some(failed) =
                        escalate_exhausted(&node, self.config.max_successive_attempts)?
                    {
                        warn!(node_id = %failed.id, state = %failed.history.tag(),
                              "retry budget exhausted");
                        node = failed;
                        self.cache.update(&self.store, &node).await?;
                        continue;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Activate successors/fallbacks named by a terminal node. Nodes that
    /// are no longer activable are left alone.
    async fn activate_all(&self, from: &NodeId, ids: &[NodeId]) -> EngineResult<Vec<NodeId>> {
        let mut activated = Vec::new();
        for id in ids {
            match self.cache.get(&self.store, id).await {
                Ok(mut node) => {
                    if node.history.is_passive() {
                        node.history
                            .activate(ActivationReason::Dependency(from.clone()));
                        self.cache.update(&self.store, &node).await?;
                        activated.push(node.id.clone());
                    }
                }
                Err(StoreError::NotFound(missing)) => {
                    warn!(node_id = %missing, activated_by = %from, "activation target missing");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(activated)
    }

    /// Resolve the dependency statuses of a building node, activating
    /// passive dependencies along the way.
    async fn check_deps(&self, node: &Node) -> EngineResult<DepsOutcome> {
        let mut failed = Vec::new();
        let mut pending = false;
        for dep_id in &node.depends_on {
            match self.cache.get(&self.store, dep_id).await {
                Ok(mut dep) => match dep.history.simplify() {
                    SimpleStatus::Successful => {}
                    SimpleStatus::Failed => failed.push(dep_id.clone()),
                    SimpleStatus::Activable => {
                        dep.history
                            .activate(ActivationReason::Dependency(node.id.clone()));
                        self.cache.update(&self.store, &dep).await?;
                        pending = true;
                    }
                    SimpleStatus::InProgress => pending = true,
                },
                Err(StoreError::NotFound(missing)) => {
                    warn!(node_id = %node.id, dependency = %missing, "dependency does not resolve");
                    failed.push(dep_id.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !failed.is_empty() {
            Ok(DepsOutcome::Failed(failed))
        } else if pending {
            Ok(DepsOutcome::Pending)
        } else {
            Ok(DepsOutcome::Ready)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
