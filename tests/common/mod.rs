//! Integration test harness.
//!
//! Provides a complete engine over an in-memory store, plus scripted
//! executors and condition evaluators so scenarios can drive the life
//! cycle without touching any real host.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gantry::{
    BuildProcess, CheckOutcome, Condition, ConditionEvaluator, Engine, EngineConfig, ExecError,
    ExecResult, Executor, ExecutorRegistry, FileTree, Host, Node, NodeCache, NodeSpec,
    QueryDescription, RunBookkeeping, Store, Volume,
};

pub const PLUGIN: &str = "scripted";

// ============================================================================
// Scripted executor
// ============================================================================

/// Executor whose outcomes are scripted per operation. Unscripted calls
/// fall back to benign defaults (start succeeds, check keeps running,
/// kill succeeds).
#[derive(Default)]
pub struct ScriptedExecutor {
    starts: Mutex<VecDeque<ExecResult<RunBookkeeping>>>,
    checks: Mutex<VecDeque<ExecResult<CheckOutcome>>>,
    kills: Mutex<VecDeque<ExecResult<RunBookkeeping>>>,
    pub start_calls: AtomicUsize,
    pub check_calls: AtomicUsize,
    pub kill_calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_start(&self, result: ExecResult<RunBookkeeping>) {
        self.starts.lock().unwrap().push_back(result);
    }

    pub fn script_check(&self, result: ExecResult<CheckOutcome>) {
        self.checks.lock().unwrap().push_back(result);
    }

    pub fn script_kill(&self, result: ExecResult<RunBookkeeping>) {
        self.kills.lock().unwrap().push_back(result);
    }

    pub fn book() -> RunBookkeeping {
        RunBookkeeping::new(PLUGIN, serde_json::json!({"job": 1}))
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn start(&self, node: &Node) -> ExecResult<RunBookkeeping> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match self.starts.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(RunBookkeeping::new(
                PLUGIN,
                serde_json::json!({"node": node.id.as_str()}),
            )),
        }
    }

    async fn check(&self, book: &RunBookkeeping) -> ExecResult<CheckOutcome> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        match self.checks.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CheckOutcome::StillRunning(book.clone())),
        }
    }

    async fn kill(&self, book: &RunBookkeeping) -> ExecResult<RunBookkeeping> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        match self.kills.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(book.clone()),
        }
    }

    fn serialize(&self, book: &RunBookkeeping) -> ExecResult<Vec<u8>> {
        serde_json::to_vec(&book.parameters).map_err(|e| ExecError::fatal(format!("encode: {e}")))
    }

    fn deserialize(&self, bytes: &[u8]) -> ExecResult<RunBookkeeping> {
        let parameters =
            serde_json::from_slice(bytes).map_err(|e| ExecError::fatal(format!("decode: {e}")))?;
        Ok(RunBookkeeping::new(PLUGIN, parameters))
    }

    async fn query(&self, _book: &RunBookkeeping, name: &str) -> ExecResult<String> {
        Err(ExecError::fatal(format!("no such query: {name}")))
    }

    fn available_queries(&self, _book: &RunBookkeeping) -> Vec<QueryDescription> {
        Vec::new()
    }
}

// ============================================================================
// Scripted evaluator
// ============================================================================

/// Condition evaluator with scripted outcomes; unscripted calls resolve
/// only the pure tags.
#[derive(Default)]
pub struct ScriptedEvaluator {
    results: Mutex<VecDeque<ExecResult<bool>>>,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, result: ExecResult<bool>) {
        self.results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ConditionEvaluator for ScriptedEvaluator {
    async fn eval(&self, condition: &Condition) -> ExecResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.results.lock().unwrap().pop_front() {
            return result;
        }
        match condition {
            Condition::Satisfied => Ok(true),
            Condition::Never => Ok(false),
            other => Err(ExecError::fatal(format!("unscripted condition: {other:?}"))),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub engine: Engine,
    pub executor: Arc<ScriptedExecutor>,
    pub evaluator: Arc<ScriptedEvaluator>,
}

impl Harness {
    pub fn store(&self) -> &Arc<Store> {
        self.engine.store()
    }

    /// Run up to `ticks` engine steps.
    pub async fn settle(&self, ticks: usize) {
        for _ in 0..ticks {
            self.engine.step().await.unwrap();
        }
    }
}

pub async fn harness() -> Harness {
    harness_with_config(EngineConfig::default()).await
}

pub async fn harness_with_config(config: EngineConfig) -> Harness {
    let store = Arc::new(Store::open("sqlite::memory:").await.unwrap());
    harness_on(store, config)
}

pub fn harness_on(store: Arc<Store>, config: EngineConfig) -> Harness {
    let executor = Arc::new(ScriptedExecutor::new());
    let evaluator = Arc::new(ScriptedEvaluator::new());
    let mut registry = ExecutorRegistry::new(Duration::from_secs(60));
    registry.register(PLUGIN, Arc::clone(&executor) as Arc<dyn Executor>);
    let engine = Engine::new(
        store,
        Arc::new(NodeCache::new()),
        Arc::new(registry),
        Arc::clone(&evaluator) as Arc<dyn ConditionEvaluator>,
        config,
    );
    Harness {
        engine,
        executor,
        evaluator,
    }
}

// ============================================================================
// Node builders
// ============================================================================

pub fn activated(mut node: Node) -> Node {
    node.history.activate(gantry::ActivationReason::User);
    node
}

pub fn noop_node(name: &str) -> Node {
    Node::create(NodeSpec {
        name: Some(name.to_string()),
        ..Default::default()
    })
}

pub fn long_running_node(name: &str) -> Node {
    Node::create(NodeSpec {
        name: Some(name.to_string()),
        build_process: Some(BuildProcess::LongRunning {
            plugin: PLUGIN.to_string(),
            run_parameters: serde_json::json!({"cmd": name}),
        }),
        ..Default::default()
    })
}

pub fn volume_condition(root: &str) -> Condition {
    Condition::VolumeExists(Volume {
        host: Host::local(),
        root: root.to_string(),
        structure: FileTree::File("done.marker".to_string()),
    })
}
