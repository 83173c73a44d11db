//! Gantry - a workflow engine driving nodes through a typed life cycle
//!
//! The crate is built around a node state-machine engine and its
//! persistence layer. The key components are:
//!
//! ## Core
//!
//! - [`model`]: the persisted node, conditions, build processes and the
//!   pointer-based stored form
//! - [`history`]: the typed history with its enforced transition table
//! - [`planner`]: pure `state -> action` planning and outcome application
//!
//! ## Infrastructure
//!
//! - [`store`]: relational persistence (main table plus add/kill queues)
//!   with transactional writes and change records
//! - [`cache`]: hot in-memory view of the live node set
//! - [`events`]: rate-limited, coalesced change stream
//! - [`engine`]: the tick loop draining queues and advancing nodes
//! - [`executor`]: the six-operation plugin boundary
//!
//! ## Surfaces
//!
//! - [`server`]: authenticated HTTP API (submit, kill, query, SSE)
//! - [`sync`]: mirroring between database URIs and backup directories
//! - [`config`]: profile-based JSON configuration

pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod history;
pub mod model;
pub mod planner;
pub mod server;
pub mod store;
pub mod sync;

// Node model
pub use model::{
    BuildProcess, Command, Condition, EquivalencePolicy, FileTree, Host, LogEntry, Node, NodeId,
    NodeSpec, Program, RunBookkeeping, StoredNode, Volume, is_equivalent,
};

// History
pub use history::{
    ActivationReason, FlatState, History, HistoryError, SimpleStatus, StateEntry, StateTag,
    Summary,
};

// Planner
pub use planner::{Action, DepsOutcome, EvalPhase, Progress, plan};

// Persistence
pub use store::{ChangeRecord, EngineStatus, Store, StoreError, StoreResult};

// Cache & change stream
pub use cache::NodeCache;
pub use events::{ChangeBatch, ChangeStream, EMIT_MAX_PENDING_WAIT, EMIT_MIN_PERIOD};

// Engine
pub use engine::{Engine, EngineConfig, EngineError, EngineHandle, StepReport};

// Executor boundary
pub use executor::{
    BuiltinEvaluator, CheckOutcome, ConditionEvaluator, ExecError, ExecResult, Executor,
    ExecutorRegistry, QueryDescription,
};

// Configuration & auth
pub use auth::TokenSet;
pub use config::{Config, EngineOptions, EXIT_BAD_ARGS, EXIT_OK, EXIT_SIGNAL, EXIT_STARTUP};
