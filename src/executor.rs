//! Executor plugin boundary.
//!
//! Every concrete executor lives outside this crate and implements
//! [`Executor`]; the engine calls exactly these operations and never
//! inspects run parameters. Errors carry a severity chosen by the plugin
//! and the engine honors it literally: recoverable errors re-enter the
//! same state with the attempt counter incremented, fatal errors advance
//! to the matching failure state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Condition, Node, RunBookkeeping};

/// Default clamp on every executor call.
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Result shape
// ============================================================================

/// The tri-valued error shape shared by executors and condition
/// evaluators.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Worth retrying later; the engine loops on the same logical state.
    #[error("recoverable: {msg}")]
    Recoverable {
        msg: String,
        book: Option<RunBookkeeping>,
    },
    /// Not worth retrying; the engine advances to a failure state.
    #[error("fatal: {msg}")]
    Fatal {
        msg: String,
        book: Option<RunBookkeeping>,
    },
}

impl ExecError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable {
            msg: msg.into(),
            book: None,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            msg: msg.into(),
            book: None,
        }
    }

    pub fn with_book(mut self, new_book: RunBookkeeping) -> Self {
        match &mut self {
            Self::Recoverable { book, .. } | Self::Fatal { book, .. } => {
                *book = Some(new_book);
            }
        }
        self
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Outcome of polling a running task.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    StillRunning(RunBookkeeping),
    Successful(RunBookkeeping),
}

/// A reflective query an executor exposes for observation UIs.
#[derive(Debug, Clone)]
pub struct QueryDescription {
    pub name: String,
    pub description: String,
}

// ============================================================================
// Traits
// ============================================================================

/// The six-operation contract implemented by external plugins.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch the work; return the opaque run bookkeeping.
    async fn start(&self, node: &Node) -> ExecResult<RunBookkeeping>;

    /// Poll the work.
    async fn check(&self, book: &RunBookkeeping) -> ExecResult<CheckOutcome>;

    /// Request termination.
    async fn kill(&self, book: &RunBookkeeping) -> ExecResult<RunBookkeeping>;

    /// Round-trip bookkeeping across engine restarts.
    fn serialize(&self, book: &RunBookkeeping) -> ExecResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> ExecResult<RunBookkeeping>;

    /// Reflective accessor used by observation UIs.
    async fn query(&self, book: &RunBookkeeping, name: &str) -> ExecResult<String>;

    fn available_queries(&self, book: &RunBookkeeping) -> Vec<QueryDescription>;
}

/// Evaluates user-supplied conditions; same severity scheme as
/// [`Executor`].
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn eval(&self, condition: &Condition) -> ExecResult<bool>;
}

/// Evaluator that resolves the pure condition tags and refuses everything
/// that would touch a host. Embedders wire a real evaluator for volume
/// and command conditions.
#[derive(Debug, Default)]
pub struct BuiltinEvaluator;

#[async_trait]
impl ConditionEvaluator for BuiltinEvaluator {
    async fn eval(&self, condition: &Condition) -> ExecResult<bool> {
        match condition {
            Condition::Satisfied => Ok(true),
            Condition::Never => Ok(false),
            Condition::AndOf(parts) => {
                for part in parts {
                    if !self.eval(part).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::VolumeExists(_)
            | Condition::VolumeSizeAtLeast(_, _)
            | Condition::CommandReturns(_, _) => Err(ExecError::fatal(
                "no condition evaluator configured for host-side conditions",
            )),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Maps plugin names to executors and clamps every call with the host
/// timeout. A timeout is a recoverable error; an unknown plugin is fatal.
pub struct ExecutorRegistry {
    plugins: HashMap<String, Arc<dyn Executor>>,
    timeout: Duration,
}

impl ExecutorRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            plugins: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.plugins.insert(name.into(), executor);
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    fn lookup(&self, name: &str) -> ExecResult<&Arc<dyn Executor>> {
        self.plugins
            .get(name)
            .ok_or_else(|| ExecError::fatal(format!("unknown executor plugin: {name}")))
    }

    async fn clamped<T>(
        &self,
        fut: impl std::future::Future<Output = ExecResult<T>>,
    ) -> ExecResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::recoverable(format!(
                "executor call timed out after {:.1}s",
                self.timeout.as_secs_f64()
            ))),
        }
    }

    pub async fn start(&self, plugin: &str, node: &Node) -> ExecResult<RunBookkeeping> {
        let executor = self.lookup(plugin)?;
        self.clamped(executor.start(node)).await
    }

    pub async fn check(&self, book: &RunBookkeeping) -> ExecResult<CheckOutcome> {
        let executor = self.lookup(&book.plugin)?;
        self.clamped(executor.check(book)).await
    }

    pub async fn kill(&self, book: &RunBookkeeping) -> ExecResult<RunBookkeeping> {
        let executor = self.lookup(&book.plugin)?;
        self.clamped(executor.kill(book)).await
    }

    pub async fn query(&self, book: &RunBookkeeping, name: &str) -> ExecResult<String> {
        let executor = self.lookup(&book.plugin)?;
        self.clamped(executor.query(book, name)).await
    }

    /// Clamp an evaluator call with the same host timeout.
    pub async fn eval_condition(
        &self,
        evaluator: &dyn ConditionEvaluator,
        condition: &Condition,
    ) -> ExecResult<bool> {
        self.clamped(evaluator.eval(condition)).await
    }
}

// ============================================================================
// Tests
// ============================================================================
