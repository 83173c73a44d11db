//! Typed node history: the life cycle encoded as an append-only list of
//! states with an enforced transition table.
//!
//! Every entry names the exact set of predecessor tags it may extend; the
//! table below is the source of truth for both the planner and the
//! push-time invariant check. Histories only ever grow, and a node is
//! finished exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::RunBookkeeping;

// ============================================================================
// State tags
// ============================================================================

/// The flat union of every state a node can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateTag {
    Passive,
    Active,
    EvaluatingCondition,
    AlreadyDone,
    Building,
    StillBuilding,
    Starting,
    TriedToStart,
    StartedRunning,
    StillRunning,
    StillRunningDespiteRecoverableError,
    RanSuccessfully,
    TriedToReevalCondition,
    SuccessfullyDidNothing,
    VerifiedSuccess,
    DidNotEnsureCondition,
    FailedToStart,
    FailedToEvalCondition,
    FailedRunning,
    DependenciesFailed,
    Killing,
    TriedToKill,
    Killed,
    FailedToKill,
    Finished,
}

impl StateTag {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Passive => "passive",
            Self::Active => "active",
            Self::EvaluatingCondition => "evaluating-condition",
            Self::AlreadyDone => "already-done",
            Self::Building => "building",
            Self::StillBuilding => "still-building",
            Self::Starting => "starting",
            Self::TriedToStart => "tried-to-start",
            Self::StartedRunning => "started-running",
            Self::StillRunning => "still-running",
            Self::StillRunningDespiteRecoverableError => {
                "still-running-despite-recoverable-error"
            }
            Self::RanSuccessfully => "ran-successfully",
            Self::TriedToReevalCondition => "tried-to-reeval-condition",
            Self::SuccessfullyDidNothing => "successfully-did-nothing",
            Self::VerifiedSuccess => "verified-success",
            Self::DidNotEnsureCondition => "did-not-ensure-condition",
            Self::FailedToStart => "failed-to-start",
            Self::FailedToEvalCondition => "failed-to-eval-condition",
            Self::FailedRunning => "failed-running",
            Self::DependenciesFailed => "dependencies-failed",
            Self::Killing => "killing",
            Self::TriedToKill => "tried-to-kill",
            Self::Killed => "killed",
            Self::FailedToKill => "failed-to-kill",
            Self::Finished => "finished",
        }
    }

    /// Terminal states: reached the end of the life cycle, only `Finished`
    /// may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VerifiedSuccess
                | Self::AlreadyDone
                | Self::DependenciesFailed
                | Self::FailedToStart
                | Self::FailedToEvalCondition
                | Self::DidNotEnsureCondition
                | Self::FailedRunning
                | Self::Killed
                | Self::FailedToKill
        )
    }

    /// States over which the work is (possibly) executing on a host.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::StartedRunning | Self::StillRunning | Self::StillRunningDespiteRecoverableError
        )
    }

    /// States a kill request can interrupt.
    pub fn is_killable(&self) -> bool {
        matches!(
            self,
            Self::Passive
                | Self::Active
                | Self::EvaluatingCondition
                | Self::Building
                | Self::StillBuilding
                | Self::Starting
                | Self::TriedToStart
                | Self::StartedRunning
                | Self::StillRunning
                | Self::StillRunningDespiteRecoverableError
        )
    }

    /// The exact set of predecessor tags this state may extend. `Passive`
    /// is the creation state and extends nothing.
    pub fn legal_predecessors(&self) -> &'static [StateTag] {
        use StateTag::*;
        match self {
            Passive => &[],
            Active => &[Passive],
            EvaluatingCondition => &[Active, EvaluatingCondition],
            AlreadyDone => &[EvaluatingCondition],
            Building => &[Active, EvaluatingCondition],
            StillBuilding => &[Building, StillBuilding],
            Starting => &[Building, StillBuilding],
            TriedToStart => &[Starting, TriedToStart],
            StartedRunning => &[Starting, TriedToStart],
            StillRunning => &[StartedRunning, StillRunning, StillRunningDespiteRecoverableError],
            StillRunningDespiteRecoverableError => {
                &[StartedRunning, StillRunning, StillRunningDespiteRecoverableError]
            }
            RanSuccessfully => {
                &[StartedRunning, StillRunning, StillRunningDespiteRecoverableError]
            }
            TriedToReevalCondition => {
                &[RanSuccessfully, SuccessfullyDidNothing, TriedToReevalCondition]
            }
            SuccessfullyDidNothing => &[Starting, TriedToStart],
            VerifiedSuccess => {
                &[RanSuccessfully, TriedToReevalCondition, SuccessfullyDidNothing]
            }
            DidNotEnsureCondition => {
                &[RanSuccessfully, SuccessfullyDidNothing, TriedToReevalCondition]
            }
            FailedToStart => &[Starting, TriedToStart],
            FailedToEvalCondition => &[EvaluatingCondition],
            FailedRunning => {
                &[StartedRunning, StillRunning, StillRunningDespiteRecoverableError]
            }
            DependenciesFailed => &[Building, StillBuilding],
            Killing => &[
                Passive,
                Active,
                EvaluatingCondition,
                Building,
                StillBuilding,
                Starting,
                TriedToStart,
                StartedRunning,
                StillRunning,
                StillRunningDespiteRecoverableError,
            ],
            TriedToKill => &[Killing, TriedToKill],
            Killed => &[Killing, TriedToKill],
            FailedToKill => &[Killing, TriedToKill],
            Finished => &[
                VerifiedSuccess,
                AlreadyDone,
                DependenciesFailed,
                FailedToStart,
                FailedToEvalCondition,
                DidNotEnsureCondition,
                FailedRunning,
                Killed,
                FailedToKill,
            ],
        }
    }
}

impl std::fmt::Display for StateTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Simplified status
// ============================================================================

/// Three-and-a-half-valued roll-up used for fast filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimpleStatus {
    /// Only `passive` histories are activable.
    Activable,
    InProgress,
    Successful,
    Failed,
}

impl SimpleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activable => "activable",
            Self::InProgress => "in-progress",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Why a node was activated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    User,
    Dependency(crate::model::NodeId),
}

impl ActivationReason {
    fn describe(&self) -> String {
        match self {
            Self::User => "activated by user".to_string(),
            Self::Dependency(id) => format!("activated as dependency of {id}"),
        }
    }
}

/// One state in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub log: Option<String>,
    pub tag: StateTag,
    /// Executor bookkeeping for states reached by interacting with a plugin.
    #[serde(default)]
    pub book: Option<RunBookkeeping>,
}

impl StateEntry {
    pub fn new(tag: StateTag) -> Self {
        Self {
            at: Utc::now(),
            log: None,
            tag,
            book: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_book(mut self, book: RunBookkeeping) -> Self {
        self.book = Some(book);
        self
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: StateTag, to: StateTag },
    #[error("history cannot be empty")]
    Empty,
}

/// Flattened view of one state, for display.
#[derive(Debug, Clone, Serialize)]
pub struct FlatState {
    pub at: DateTime<Utc>,
    pub name: &'static str,
    pub log: Option<String>,
    pub book: Option<String>,
}

/// Compact roll-up of the newest state.
#[derive(Debug, Clone)]
pub struct Summary {
    pub at: DateTime<Utc>,
    pub message: Option<String>,
    pub info: Vec<String>,
}

/// The append-only list of past states, newest last. All mutation goes
/// through [`History::push`], which enforces the transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<StateEntry>,
}

impl History {
    /// The creation history: a single `passive` entry.
    pub fn created() -> Self {
        Self {
            entries: vec![StateEntry::new(StateTag::Passive).with_log("created")],
        }
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest entry. Histories are constructed non-empty and never
    /// shrink, so this cannot fail.
    pub fn latest(&self) -> &StateEntry {
        self.entries.last().expect("history is never empty")
    }

    pub fn tag(&self) -> StateTag {
        self.latest().tag
    }

    pub fn is_passive(&self) -> bool {
        self.tag() == StateTag::Passive
    }

    pub fn is_finished(&self) -> bool {
        self.tag() == StateTag::Finished
    }

    /// For a finished history, the terminal state it finished over.
    pub fn pre_terminal(&self) -> Option<StateTag> {
        if self.tag() != StateTag::Finished {
            return None;
        }
        self.entries
            .iter()
            .rev()
            .map(|e| e.tag)
            .find(|t| *t != StateTag::Finished)
    }

    /// Append a state, enforcing the transition table.
    pub fn push(&mut self, entry: StateEntry) -> Result<(), HistoryError> {
        let from = self.tag();
        if !entry.tag.legal_predecessors().contains(&from) {
            return Err(HistoryError::IllegalTransition {
                from,
                to: entry.tag,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Activate a passive history.
    ///
    /// # Panics
    ///
    /// Activating a non-passive history is a programming error, not a
    /// runtime condition, and aborts.
    pub fn activate(&mut self, reason: ActivationReason) {
        assert!(
            self.is_passive(),
            "activate on non-passive history (current state: {})",
            self.tag()
        );
        self.entries
            .push(StateEntry::new(StateTag::Active).with_log(reason.describe()));
    }

    /// Request a kill. Returns `None` when the current state is not
    /// killable, leaving the caller to ignore the request.
    pub fn kill(&mut self) -> Option<()> {
        if !self.tag().is_killable() {
            return None;
        }
        let book = self.latest_run_bookkeeping().cloned();
        let mut entry = StateEntry::new(StateTag::Killing).with_log("kill requested");
        if let Some(book) = book {
            entry = entry.with_book(book);
        }
        self.entries.push(entry);
        Some(())
    }

    /// The most recent executor bookkeeping recorded anywhere in the
    /// history.
    pub fn latest_run_bookkeeping(&self) -> Option<&RunBookkeeping> {
        self.entries.iter().rev().find_map(|e| e.book.as_ref())
    }

    /// For a `killing`/`tried-to-kill` history, the killable state the kill
    /// request landed on.
    pub fn killed_from(&self) -> Option<StateTag> {
        if !matches!(self.tag(), StateTag::Killing | StateTag::TriedToKill) {
            return None;
        }
        self.entries
            .iter()
            .rev()
            .map(|e| e.tag)
            .find(|t| !matches!(t, StateTag::Killing | StateTag::TriedToKill))
    }

    /// Number of consecutive newest entries sharing the current tag.
    /// Retry loops grow this; any forward transition resets it.
    pub fn successive_attempts(&self) -> u32 {
        let tag = self.tag();
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.tag == tag)
            .count() as u32
    }

    /// Pure derived status; invariant against bookkeeping and log content.
    pub fn simplify(&self) -> SimpleStatus {
        let effective = match self.tag() {
            StateTag::Finished => self.pre_terminal().unwrap_or(StateTag::Finished),
            tag => tag,
        };
        match effective {
            StateTag::Passive => SimpleStatus::Activable,
            StateTag::VerifiedSuccess | StateTag::AlreadyDone => SimpleStatus::Successful,
            tag if tag.is_terminal() => SimpleStatus::Failed,
            _ => SimpleStatus::InProgress,
        }
    }

    /// `(time, optional message, info strings)` for the newest state.
    pub fn summary(&self) -> Summary {
        let latest = self.latest();
        let mut info = vec![
            format!("state: {}", latest.tag),
            format!("status: {}", self.simplify().as_str()),
        ];
        let attempts = self.successive_attempts();
        if attempts > 1 {
            info.push(format!("attempts: {attempts}"));
        }
        if let Some(book) = self.latest_run_bookkeeping() {
            info.push(format!("plugin: {}", book.plugin));
        }
        Summary {
            at: latest.at,
            message: latest.log.clone(),
            info,
        }
    }

    /// The whole history as display rows, oldest first.
    pub fn flatten(&self) -> Vec<FlatState> {
        self.entries
            .iter()
            .map(|e| FlatState {
                at: e.at,
                name: e.tag.name(),
                log: e.log.clone(),
                book: e.book.as_ref().map(|b| b.describe()),
            })
            .collect()
    }

    /// Debug-time invariant check: every adjacent pair must be in the
    /// transition table.
    pub fn check_invariants(&self) -> Result<(), HistoryError> {
        if self.entries.is_empty() {
            return Err(HistoryError::Empty);
        }
        for pair in self.entries.windows(2) {
            if !pair[1].tag.legal_predecessors().contains(&pair[0].tag) {
                return Err(HistoryError::IllegalTransition {
                    from: pair[0].tag,
                    to: pair[1].tag,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
