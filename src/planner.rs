//! Transition planner: the pure function from a node's current state to
//! the action the engine should take next.
//!
//! The planner returns descriptions, not effects. Dispatching the action
//! (executor calls, condition evaluation, dependency lookups) is the
//! engine's job; folding the outcome back into a new history happens in
//! the `apply_*` functions below, which are equally pure. This split is
//! what makes the engine testable without mocks.

use crate::executor::{CheckOutcome, ExecError, ExecResult};
use crate::history::{HistoryError, StateEntry, StateTag};
use crate::model::{BuildProcess, Condition, Node, NodeId, RunBookkeeping};

// ============================================================================
// Actions
// ============================================================================

/// Which side of the run a condition evaluation sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    /// Before building: decides whether work is needed at all.
    Entering,
    /// After a successful run: decides whether the work ensured the
    /// condition.
    Leaving,
}

/// What the engine should do with a node, as decided by [`plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to dispatch. `then` carries an inline transition the engine
    /// applies immediately without contacting any executor.
    DoNothing { then: Option<StateTag> },
    /// Arrived at a terminal state: activate these successors/fallbacks,
    /// then finish.
    Activate { ids: Vec<NodeId> },
    /// Check dependency statuses (engine-side lookup, no executor).
    CheckDeps,
    /// Launch the work through the plugin named in the bookkeeping.
    StartRunning(RunBookkeeping),
    /// Submit the condition to the evaluator.
    EvalCondition {
        condition: Condition,
        phase: EvalPhase,
    },
    /// Poll the running work.
    CheckProcess(RunBookkeeping),
    /// Ask the plugin to terminate the work.
    Kill(RunBookkeeping),
}

/// Whether an application moved the node forward. `Unchanged` covers
/// self-states and retries: the engine defers the node to a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Changed,
    Unchanged,
}

/// Dependency check outcome, computed by the engine from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DepsOutcome {
    /// Every dependency is successful.
    Ready,
    /// At least one dependency failed.
    Failed(Vec<NodeId>),
    /// Dependencies still in progress or not yet activated.
    Pending,
}

// ============================================================================
// Planning
// ============================================================================

/// Decide the next action for a node. Pure: identical input yields an
/// action of identical shape.
pub fn plan(node: &Node) -> Action {
    let tag = node.history.tag();
    match tag {
        StateTag::Passive | StateTag::Finished => Action::DoNothing { then: None },

        StateTag::Active => match &node.condition {
            Some(condition) => Action::EvalCondition {
                condition: condition.clone(),
                phase: EvalPhase::Entering,
            },
            None => Action::DoNothing {
                then: Some(StateTag::Building),
            },
        },

        StateTag::EvaluatingCondition => match &node.condition {
            Some(condition) => Action::EvalCondition {
                condition: condition.clone(),
                phase: EvalPhase::Entering,
            },
            // A condition-less node never enters this state; recover by
            // moving on to the build.
            None => Action::DoNothing {
                then: Some(StateTag::Building),
            },
        },

        StateTag::Building | StateTag::StillBuilding => Action::CheckDeps,

        StateTag::Starting | StateTag::TriedToStart => match &node.build_process {
            BuildProcess::NoOp => Action::DoNothing {
                then: Some(StateTag::SuccessfullyDidNothing),
            },
            BuildProcess::LongRunning {
                plugin,
                run_parameters,
            } => Action::StartRunning(RunBookkeeping::new(
                plugin.clone(),
                run_parameters.clone(),
            )),
        },

        StateTag::StartedRunning
        | StateTag::StillRunning
        | StateTag::StillRunningDespiteRecoverableError => {
            match node.history.latest_run_bookkeeping() {
                Some(book) => Action::CheckProcess(book.clone()),
                // Running without bookkeeping cannot be polled; reconstruct
                // the launch template so the plugin can decide.
                None => match &node.build_process {
                    BuildProcess::LongRunning {
                        plugin,
                        run_parameters,
                    } => Action::CheckProcess(RunBookkeeping::new(
                        plugin.clone(),
                        run_parameters.clone(),
                    )),
                    BuildProcess::NoOp => Action::DoNothing { then: None },
                },
            }
        }

        StateTag::RanSuccessfully
        | StateTag::SuccessfullyDidNothing
        | StateTag::TriedToReevalCondition => match &node.condition {
            Some(condition) => Action::EvalCondition {
                condition: condition.clone(),
                phase: EvalPhase::Leaving,
            },
            None => Action::DoNothing {
                then: Some(StateTag::VerifiedSuccess),
            },
        },

        StateTag::Killing | StateTag::TriedToKill => {
            let from = node.history.killed_from();
            let running = from.map(|t| t.is_running()).unwrap_or(false);
            if running {
                match node.history.latest_run_bookkeeping() {
                    Some(book) => Action::Kill(book.clone()),
                    None => Action::DoNothing {
                        then: Some(StateTag::Killed),
                    },
                }
            } else {
                // Nothing was launched; no executor contact needed.
                Action::DoNothing {
                    then: Some(StateTag::Killed),
                }
            }
        }

        tag if tag.is_terminal() => {
            let successful = matches!(tag, StateTag::VerifiedSuccess | StateTag::AlreadyDone);
            let ids = if successful {
                node.on_success_activate.clone()
            } else {
                node.on_failure_activate.clone()
            };
            Action::Activate { ids }
        }

        // All tags are covered above; the guard arm keeps the match
        // exhaustive for the compiler.
        _ => Action::DoNothing { then: None },
    }
}

// ============================================================================
// Application
// ============================================================================

fn extended(node: &Node, entry: StateEntry) -> Result<Node, HistoryError> {
    let mut next = node.clone();
    next.history.push(entry)?;
    Ok(next)
}

/// Apply an inline transition decided by [`plan`].
pub fn apply_inline(node: &Node, then: StateTag) -> Result<(Node, Progress), HistoryError> {
    let next = extended(node, StateEntry::new(then))?;
    Ok((next, Progress::Changed))
}

/// Fold a dependency check into the history.
pub fn apply_deps(node: &Node, outcome: DepsOutcome) -> Result<(Node, Progress), HistoryError> {
    match outcome {
        DepsOutcome::Ready => {
            let next = extended(node, StateEntry::new(StateTag::Starting))?;
            Ok((next, Progress::Changed))
        }
        DepsOutcome::Failed(failed) => {
            let names: Vec<String> = failed.iter().map(|id| id.to_string()).collect();
            let next = extended(
                node,
                StateEntry::new(StateTag::DependenciesFailed)
                    .with_log(format!("dependencies failed: [{}]", names.join(", "))),
            )?;
            Ok((next, Progress::Changed))
        }
        DepsOutcome::Pending => {
            if node.history.tag() == StateTag::Building {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::StillBuilding).with_log("waiting on dependencies"),
                )?;
                Ok((next, Progress::Unchanged))
            } else {
                Ok((node.clone(), Progress::Unchanged))
            }
        }
    }
}

/// Fold a `start` result into the history.
pub fn apply_start(
    node: &Node,
    result: ExecResult<RunBookkeeping>,
) -> Result<(Node, Progress), HistoryError> {
    match result {
        Ok(book) => {
            let next = extended(
                node,
                StateEntry::new(StateTag::StartedRunning).with_book(book),
            )?;
            Ok((next, Progress::Changed))
        }
        Err(ExecError::Recoverable { msg, book }) => {
            let mut entry = StateEntry::new(StateTag::TriedToStart).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Unchanged))
        }
        Err(ExecError::Fatal { msg, book }) => {
            let mut entry = StateEntry::new(StateTag::FailedToStart).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Changed))
        }
    }
}

/// Fold a `check` result into the history.
pub fn apply_check_process(
    node: &Node,
    result: ExecResult<CheckOutcome>,
) -> Result<(Node, Progress), HistoryError> {
    match result {
        Ok(CheckOutcome::StillRunning(book)) => {
            let next = extended(node, StateEntry::new(StateTag::StillRunning).with_book(book))?;
            Ok((next, Progress::Unchanged))
        }
        Ok(CheckOutcome::Successful(book)) => {
            let next = extended(
                node,
                StateEntry::new(StateTag::RanSuccessfully).with_book(book),
            )?;
            Ok((next, Progress::Changed))
        }
        Err(ExecError::Recoverable { msg, book }) => {
            let mut entry =
                StateEntry::new(StateTag::StillRunningDespiteRecoverableError).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Unchanged))
        }
        Err(ExecError::Fatal { msg, book }) => {
            let mut entry = StateEntry::new(StateTag::FailedRunning).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Changed))
        }
    }
}

/// Fold a condition evaluation into the history.
pub fn apply_eval(
    node: &Node,
    phase: EvalPhase,
    result: ExecResult<bool>,
) -> Result<(Node, Progress), HistoryError> {
    match phase {
        EvalPhase::Entering => match result {
            // The evaluation attempt itself is a state; retries stack.
            Ok(true) => {
                let evaluating = extended(node, StateEntry::new(StateTag::EvaluatingCondition))?;
                let next = extended(
                    &evaluating,
                    StateEntry::new(StateTag::AlreadyDone).with_log("condition already satisfied"),
                )?;
                Ok((next, Progress::Changed))
            }
            Ok(false) => {
                let evaluating = extended(node, StateEntry::new(StateTag::EvaluatingCondition))?;
                let next = extended(&evaluating, StateEntry::new(StateTag::Building))?;
                Ok((next, Progress::Changed))
            }
            Err(ExecError::Recoverable { msg, .. }) => {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::EvaluatingCondition).with_log(msg),
                )?;
                Ok((next, Progress::Unchanged))
            }
            Err(ExecError::Fatal { msg, .. }) => {
                let evaluating = extended(node, StateEntry::new(StateTag::EvaluatingCondition))?;
                let next = extended(
                    &evaluating,
                    StateEntry::new(StateTag::FailedToEvalCondition).with_log(msg),
                )?;
                Ok((next, Progress::Changed))
            }
        },
        EvalPhase::Leaving => match result {
            Ok(true) => {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::VerifiedSuccess).with_log("condition verified"),
                )?;
                Ok((next, Progress::Changed))
            }
            Ok(false) => {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::DidNotEnsureCondition)
                        .with_log("run did not ensure the condition"),
                )?;
                Ok((next, Progress::Changed))
            }
            Err(ExecError::Recoverable { msg, .. }) => {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::TriedToReevalCondition).with_log(msg),
                )?;
                Ok((next, Progress::Unchanged))
            }
            Err(ExecError::Fatal { msg, .. }) => {
                let next = extended(
                    node,
                    StateEntry::new(StateTag::DidNotEnsureCondition).with_log(msg),
                )?;
                Ok((next, Progress::Changed))
            }
        },
    }
}

/// Fold a `kill` result into the history.
pub fn apply_kill(
    node: &Node,
    result: ExecResult<RunBookkeeping>,
) -> Result<(Node, Progress), HistoryError> {
    match result {
        Ok(book) => {
            let next = extended(node, StateEntry::new(StateTag::Killed).with_book(book))?;
            Ok((next, Progress::Changed))
        }
        Err(ExecError::Recoverable { msg, book }) => {
            let mut entry = StateEntry::new(StateTag::TriedToKill).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Unchanged))
        }
        Err(ExecError::Fatal { msg, book }) => {
            let mut entry = StateEntry::new(StateTag::FailedToKill).with_log(msg);
            if let Some(book) = book {
                entry = entry.with_book(book);
            }
            let next = extended(node, entry)?;
            Ok((next, Progress::Changed))
        }
    }
}

/// Finish a terminal node after its successors were activated.
pub fn apply_finish(node: &Node, activated: &[NodeId]) -> Result<(Node, Progress), HistoryError> {
    let log = if activated.is_empty() {
        "finished".to_string()
    } else {
        let names: Vec<String> = activated.iter().map(|id| id.to_string()).collect();
        format!("finished, activated [{}]", names.join(", "))
    };
    let next = extended(node, StateEntry::new(StateTag::Finished).with_log(log))?;
    Ok((next, Progress::Changed))
}

/// Retry states that escalate to a failure once the attempt budget is
/// spent, paired with the failure they escalate to.
fn exhaustion_failure(tag: StateTag) -> Option<StateTag> {
    match tag {
        StateTag::TriedToStart => Some(StateTag::FailedToStart),
        StateTag::StillRunningDespiteRecoverableError => Some(StateTag::FailedRunning),
        StateTag::EvaluatingCondition => Some(StateTag::FailedToEvalCondition),
        StateTag::TriedToReevalCondition => Some(StateTag::DidNotEnsureCondition),
        StateTag::TriedToKill => Some(StateTag::FailedToKill),
        _ => None,
    }
}

/// When a retry state has burned through `max_successive_attempts`,
/// escalate it to the matching failure with a descriptive log. Returns
/// `None` when the node is not in an exhaustible state or still has
/// budget.
pub fn escalate_exhausted(
    node: &Node,
    max_successive_attempts: u32,
) -> Result<Option<Node>, HistoryError> {
    let tag = node.history.tag();
    let Some(failure) = exhaustion_failure(tag) else {
        return Ok(None);
    };
    let attempts = node.history.successive_attempts();
    if attempts < max_successive_attempts {
        return Ok(None);
    }
    let next = extended(
        node,
        StateEntry::new(failure).with_log(format!(
            "giving up after {attempts} successive attempts in state {tag}"
        )),
    )?;
    Ok(Some(next))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ActivationReason;
    use crate::model::{EquivalencePolicy, NodeSpec};

    fn active_node(spec: NodeSpec) -> Node {
        let mut node = Node::create(spec);
        node.history.activate(ActivationReason::User);
        node
    }

    fn long_running() -> BuildProcess {
        BuildProcess::LongRunning {
            plugin: "daemon".to_string(),
            run_parameters: serde_json::json!({"cmd": "sleep 5"}),
        }
    }

    #[test]
    fn plan_is_idempotent() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        assert_eq!(plan(&node), plan(&node));
    }

    #[test]
    fn passive_and_finished_plan_nothing() {
        let node = Node::create(NodeSpec::default());
        assert_eq!(plan(&node), Action::DoNothing { then: None });
    }

    #[test]
    fn active_without_condition_goes_to_building() {
        let node = active_node(NodeSpec::default());
        assert_eq!(
            plan(&node),
            Action::DoNothing {
                then: Some(StateTag::Building)
            }
        );
    }

    #[test]
    fn active_with_condition_evaluates_first() {
        let node = active_node(NodeSpec {
            condition: Some(Condition::Never),
            ..Default::default()
        });
        assert_eq!(
            plan(&node),
            Action::EvalCondition {
                condition: Condition::Never,
                phase: EvalPhase::Entering
            }
        );
    }

    #[test]
    fn noop_build_skips_straight_to_did_nothing() {
        let node = active_node(NodeSpec::default());
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        assert_eq!(
            plan(&node),
            Action::DoNothing {
                then: Some(StateTag::SuccessfullyDidNothing)
            }
        );
    }

    #[test]
    fn successful_run_without_condition_verifies_directly() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let book = RunBookkeeping::new("daemon", serde_json::json!({"pid": 7}));
        let (node, _) = apply_start(&node, Ok(book.clone())).unwrap();
        let (node, progress) =
            apply_check_process(&node, Ok(CheckOutcome::Successful(book))).unwrap();
        assert_eq!(progress, Progress::Changed);
        assert_eq!(
            plan(&node),
            Action::DoNothing {
                then: Some(StateTag::VerifiedSuccess)
            }
        );
    }

    #[test]
    fn deps_failure_records_the_culprits() {
        let node = active_node(NodeSpec {
            depends_on: vec![NodeId::from("b")],
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, progress) =
            apply_deps(&node, DepsOutcome::Failed(vec![NodeId::from("b")])).unwrap();
        assert_eq!(progress, Progress::Changed);
        assert_eq!(node.history.tag(), StateTag::DependenciesFailed);
        assert_eq!(
            node.history.latest().log.as_deref(),
            Some("dependencies failed: [b]")
        );
    }

    #[test]
    fn pending_deps_park_in_still_building_once() {
        let node = active_node(NodeSpec {
            depends_on: vec![NodeId::from("b")],
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, progress) = apply_deps(&node, DepsOutcome::Pending).unwrap();
        assert_eq!(progress, Progress::Unchanged);
        assert_eq!(node.history.tag(), StateTag::StillBuilding);
        let before = node.history.len();
        let (node, progress) = apply_deps(&node, DepsOutcome::Pending).unwrap();
        assert_eq!(progress, Progress::Unchanged);
        assert_eq!(node.history.len(), before);
    }

    #[test]
    fn recoverable_start_errors_loop_on_tried_to_start() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let (node, progress) =
            apply_start(&node, Err(ExecError::recoverable("queue full"))).unwrap();
        assert_eq!(progress, Progress::Unchanged);
        assert_eq!(node.history.tag(), StateTag::TriedToStart);
        // Still plans a start; same action shape as before.
        assert!(matches!(plan(&node), Action::StartRunning(_)));
    }

    #[test]
    fn recoverable_check_errors_accumulate_and_recover() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let book = RunBookkeeping::new("daemon", serde_json::json!({"pid": 7}));
        let (mut node, _) = apply_start(&node, Ok(book.clone())).unwrap();
        for _ in 0..3 {
            let (next, progress) =
                apply_check_process(&node, Err(ExecError::recoverable("net-timeout"))).unwrap();
            assert_eq!(progress, Progress::Unchanged);
            node = next;
        }
        assert_eq!(node.history.successive_attempts(), 3);
        let (node, _) =
            apply_check_process(&node, Ok(CheckOutcome::Successful(book))).unwrap();
        assert_eq!(node.history.tag(), StateTag::RanSuccessfully);
    }

    #[test]
    fn fatal_check_error_fails_the_run() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let book = RunBookkeeping::new("daemon", serde_json::json!({}));
        let (node, _) = apply_start(&node, Ok(book)).unwrap();
        let (node, progress) =
            apply_check_process(&node, Err(ExecError::fatal("boom"))).unwrap();
        assert_eq!(progress, Progress::Changed);
        assert_eq!(node.history.tag(), StateTag::FailedRunning);
        assert_eq!(node.history.latest().log.as_deref(), Some("boom"));
        // Terminal: the plan activates failure successors.
        assert_eq!(plan(&node), Action::Activate { ids: vec![] });
    }

    #[test]
    fn entering_eval_true_is_already_done() {
        let node = active_node(NodeSpec {
            condition: Some(Condition::Satisfied),
            ..Default::default()
        });
        let (node, progress) = apply_eval(&node, EvalPhase::Entering, Ok(true)).unwrap();
        assert_eq!(progress, Progress::Changed);
        assert_eq!(node.history.tag(), StateTag::AlreadyDone);
        let tags: Vec<StateTag> = node.history.entries().iter().map(|e| e.tag).collect();
        assert_eq!(
            tags,
            vec![
                StateTag::Passive,
                StateTag::Active,
                StateTag::EvaluatingCondition,
                StateTag::AlreadyDone
            ]
        );
    }

    #[test]
    fn entering_eval_false_builds() {
        let node = active_node(NodeSpec {
            condition: Some(Condition::Never),
            ..Default::default()
        });
        let (node, _) = apply_eval(&node, EvalPhase::Entering, Ok(false)).unwrap();
        assert_eq!(node.history.tag(), StateTag::Building);
    }

    #[test]
    fn leaving_eval_false_is_did_not_ensure() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            condition: Some(Condition::Never),
            ..Default::default()
        });
        let (node, _) = apply_eval(&node, EvalPhase::Entering, Ok(false)).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let book = RunBookkeeping::new("daemon", serde_json::json!({}));
        let (node, _) = apply_start(&node, Ok(book.clone())).unwrap();
        let (node, _) = apply_check_process(&node, Ok(CheckOutcome::Successful(book))).unwrap();
        let (node, _) = apply_eval(&node, EvalPhase::Leaving, Ok(false)).unwrap();
        assert_eq!(node.history.tag(), StateTag::DidNotEnsureCondition);
        assert_eq!(node.history.simplify(), crate::history::SimpleStatus::Failed);
    }

    #[test]
    fn kill_from_non_running_skips_the_executor() {
        let mut node = active_node(NodeSpec::default());
        node.history.kill().unwrap();
        assert_eq!(
            plan(&node),
            Action::DoNothing {
                then: Some(StateTag::Killed)
            }
        );
    }

    #[test]
    fn kill_from_running_contacts_the_executor() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let book = RunBookkeeping::new("daemon", serde_json::json!({"pid": 9}));
        let (mut node, _) = apply_start(&node, Ok(book.clone())).unwrap();
        node.history.kill().unwrap();
        assert_eq!(plan(&node), Action::Kill(book.clone()));

        // A failed attempt parks on tried-to-kill but still unwinds to the
        // running predecessor and plans another kill.
        let (node, progress) =
            apply_kill(&node, Err(ExecError::recoverable("host unreachable"))).unwrap();
        assert_eq!(progress, Progress::Unchanged);
        assert_eq!(plan(&node), Action::Kill(book.clone()));

        let (node, _) = apply_kill(&node, Ok(book)).unwrap();
        assert_eq!(node.history.tag(), StateTag::Killed);
    }

    #[test]
    fn terminal_activation_picks_the_right_list() {
        let spec = NodeSpec {
            on_success_activate: vec![NodeId::from("next")],
            on_failure_activate: vec![NodeId::from("cleanup")],
            equivalence: Some(EquivalencePolicy::None),
            ..Default::default()
        };
        let ok = {
            let node = active_node(spec.clone());
            let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
            let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
            let (node, _) = apply_inline(&node, StateTag::SuccessfullyDidNothing).unwrap();
            let (node, _) = apply_inline(&node, StateTag::VerifiedSuccess).unwrap();
            node
        };
        assert_eq!(
            plan(&ok),
            Action::Activate {
                ids: vec![NodeId::from("next")]
            }
        );

        let failed = {
            let node = active_node(spec);
            let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
            let (node, _) =
                apply_deps(&node, DepsOutcome::Failed(vec![NodeId::from("dep")])).unwrap();
            node
        };
        assert_eq!(
            plan(&failed),
            Action::Activate {
                ids: vec![NodeId::from("cleanup")]
            }
        );
    }

    #[test]
    fn finish_records_activations() {
        let node = active_node(NodeSpec::default());
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        let (node, _) = apply_inline(&node, StateTag::SuccessfullyDidNothing).unwrap();
        let (node, _) = apply_inline(&node, StateTag::VerifiedSuccess).unwrap();
        let (node, _) = apply_finish(&node, &[NodeId::from("next")]).unwrap();
        assert!(node.history.is_finished());
        assert_eq!(
            node.history.latest().log.as_deref(),
            Some("finished, activated [next]")
        );
    }

    #[test]
    fn exhausted_retries_escalate() {
        let node = active_node(NodeSpec {
            build_process: Some(long_running()),
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (mut node, _) = apply_deps(&node, DepsOutcome::Ready).unwrap();
        for _ in 0..3 {
            let (next, _) =
                apply_start(&node, Err(ExecError::recoverable("queue full"))).unwrap();
            node = next;
        }
        assert!(escalate_exhausted(&node, 10).unwrap().is_none());
        let failed = escalate_exhausted(&node, 3).unwrap().unwrap();
        assert_eq!(failed.history.tag(), StateTag::FailedToStart);
        assert!(
            failed
                .history
                .latest()
                .log
                .as_deref()
                .unwrap()
                .contains("3 successive attempts")
        );
    }

    #[test]
    fn still_building_never_escalates() {
        let node = active_node(NodeSpec {
            depends_on: vec![NodeId::from("b")],
            ..Default::default()
        });
        let (node, _) = apply_inline(&node, StateTag::Building).unwrap();
        let (node, _) = apply_deps(&node, DepsOutcome::Pending).unwrap();
        assert!(escalate_exhausted(&node, 1).unwrap().is_none());
    }
}
