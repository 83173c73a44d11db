//! Node model: the persisted unit of work.
//!
//! A [`Node`] bundles everything the engine needs to drive one unit of work:
//! its dependency edges, the build process to launch, an optional condition
//! deciding whether the work is needed at all, and the typed [`History`]
//! recording every state it has passed through.
//!
//! Nodes exchange nothing but success/failure; there is no payload routing
//! between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::history::History;

/// Maximum pointer hops before a dereference is declared cyclic.
pub const MAX_POINTER_HOPS: usize = 1000;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable, globally unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh identifier.
    pub fn fresh() -> Self {
        Self(format!("gantry_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Hosts, volumes, commands
// ============================================================================

/// A compute host reference. The engine treats this as an address to hand to
/// plugins; it never connects anywhere itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    /// Connection string understood by the transport plugin (e.g. `ssh://..`).
    pub connection: String,
}

impl Host {
    pub fn local() -> Self {
        Self {
            name: "localhost".to_string(),
            connection: "local://".to_string(),
        }
    }
}

/// A file tree rooted somewhere on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTree {
    File(String),
    Directory(String, Vec<FileTree>),
}

/// A host reference plus a root path and the expected tree underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub host: Host,
    pub root: String,
    pub structure: FileTree,
}

/// A program to run on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    Shell(String),
    Exec(Vec<String>),
    Sequence(Vec<Program>),
}

/// A host reference plus a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub host: Host,
    pub program: Program,
}

// ============================================================================
// Conditions
// ============================================================================

/// User-supplied predicate evaluated before and after the work to decide
/// whether the work is needed and whether it succeeded.
///
/// The engine only submits conditions to an evaluator; beyond the tag it
/// interprets nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Never needs to run.
    Satisfied,
    /// Always runs.
    Never,
    VolumeExists(Volume),
    VolumeSizeAtLeast(Volume, u64),
    CommandReturns(Command, i32),
    AndOf(Vec<Condition>),
}

// ============================================================================
// Build process & bookkeeping
// ============================================================================

/// What running this node means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildProcess {
    /// Nothing to launch; the node succeeds by doing nothing (its condition,
    /// if any, still gets verified).
    NoOp,
    /// Work launched through the named executor plugin.
    LongRunning {
        plugin: String,
        run_parameters: serde_json::Value,
    },
}

/// Opaque executor-owned bookkeeping identifying a running task, paired with
/// the plugin that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBookkeeping {
    pub plugin: String,
    pub parameters: serde_json::Value,
}

impl RunBookkeeping {
    pub fn new(plugin: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            parameters,
        }
    }

    /// One-line description for history display.
    pub fn describe(&self) -> String {
        format!("[{}] {}", self.plugin, self.parameters)
    }
}

// ============================================================================
// Equivalence
// ============================================================================

/// Policy deciding whether a submitted node may be collapsed into a pointer
/// at an existing live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquivalencePolicy {
    None,
    SameActiveCondition,
}

// ============================================================================
// Node
// ============================================================================

/// Append-only log entry attached to a node outside its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    #[serde(default)]
    pub on_failure_activate: Vec<NodeId>,
    #[serde(default)]
    pub on_success_activate: Vec<NodeId>,
    pub build_process: BuildProcess,
    #[serde(default)]
    pub condition: Option<Condition>,
    pub equivalence: EquivalencePolicy,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    pub history: History,
}

/// Everything needed to create a node, minus the parts the engine fills in.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub id: Option<NodeId>,
    pub name: Option<String>,
    pub metadata: Option<String>,
    pub depends_on: Vec<NodeId>,
    pub on_failure_activate: Vec<NodeId>,
    pub on_success_activate: Vec<NodeId>,
    pub build_process: Option<BuildProcess>,
    pub condition: Option<Condition>,
    pub equivalence: Option<EquivalencePolicy>,
    pub tags: Vec<String>,
}

impl Node {
    /// Create a fresh passive node.
    pub fn create(spec: NodeSpec) -> Self {
        let id = spec.id.unwrap_or_else(NodeId::fresh);
        let name = spec.name.unwrap_or_else(|| id.to_string());
        Self {
            id,
            name,
            metadata: spec.metadata,
            depends_on: spec.depends_on,
            on_failure_activate: spec.on_failure_activate,
            on_success_activate: spec.on_success_activate,
            build_process: spec.build_process.unwrap_or(BuildProcess::NoOp),
            condition: spec.condition,
            equivalence: spec.equivalence.unwrap_or(EquivalencePolicy::None),
            tags: spec.tags,
            log: Vec::new(),
            history: History::created(),
        }
    }

    /// Append to the additional-log.
    pub fn log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// A fresh passive copy of a finished node, under a new identity.
    pub fn reactivate(
        &self,
        new_id: NodeId,
        new_name: Option<String>,
        new_metadata: Option<String>,
    ) -> Self {
        let name = new_name.unwrap_or_else(|| self.name.clone());
        Self {
            id: new_id,
            name,
            metadata: new_metadata.or_else(|| self.metadata.clone()),
            depends_on: self.depends_on.clone(),
            on_failure_activate: self.on_failure_activate.clone(),
            on_success_activate: self.on_success_activate.clone(),
            build_process: self.build_process.clone(),
            condition: self.condition.clone(),
            equivalence: self.equivalence,
            tags: self.tags.clone(),
            log: Vec::new(),
            history: History::created(),
        }
    }
}

/// Equivalence test used by the add-path dedup fold.
///
/// The policy of the *incoming* node decides; the relation is deliberately
/// not commutative at submission time.
pub fn is_equivalent(incoming: &Node, existing: &Node) -> bool {
    match incoming.equivalence {
        EquivalencePolicy::None => false,
        EquivalencePolicy::SameActiveCondition => match (&incoming.condition, &existing.condition)
        {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

// ============================================================================
// Stored form
// ============================================================================

/// The wire/DB form of a node: either the node itself or a pointer forwarding
/// every query to another id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredNode {
    Inline(Node),
    Pointer { id: NodeId, points_to: NodeId },
}

impl StoredNode {
    pub fn id(&self) -> &NodeId {
        match self {
            StoredNode::Inline(node) => &node.id,
            StoredNode::Pointer { id, .. } => id,
        }
    }

    pub fn as_inline(&self) -> Option<&Node> {
        match self {
            StoredNode::Inline(node) => Some(node),
            StoredNode::Pointer { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u32),
    #[error("blob decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Version tag wrapper for the persisted blob; explicit to allow forward
/// migration.
#[derive(Debug, Serialize, Deserialize)]
struct VersionedBlob {
    v: u32,
    node: StoredNode,
}

const BLOB_VERSION: u32 = 1;

/// Encode a stored node into its persisted text form.
pub fn encode_stored(stored: &StoredNode) -> Result<String, WireError> {
    let blob = VersionedBlob {
        v: BLOB_VERSION,
        node: stored.clone(),
    };
    Ok(serde_json::to_string(&blob)?)
}

/// Decode the persisted text form back into a stored node.
pub fn decode_stored(text: &str) -> Result<StoredNode, WireError> {
    let blob: VersionedBlob = serde_json::from_str(text)?;
    if blob.v != BLOB_VERSION {
        return Err(WireError::UnsupportedVersion(blob.v));
    }
    Ok(blob.node)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn condition_fixture() -> Condition {
        Condition::VolumeExists(Volume {
            host: Host::local(),
            root: "/data/out".to_string(),
            structure: FileTree::File("result.bam".to_string()),
        })
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = NodeId::fresh();
        let b = NodeId::fresh();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("gantry_"));
    }

    #[test]
    fn create_defaults_to_noop_passive() {
        let node = Node::create(NodeSpec::default());
        assert_eq!(node.build_process, BuildProcess::NoOp);
        assert_eq!(node.equivalence, EquivalencePolicy::None);
        assert!(node.history.is_passive());
        assert_eq!(node.name, node.id.to_string());
    }

    #[test]
    fn equivalence_none_never_matches() {
        let a = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            ..Default::default()
        });
        let b = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            ..Default::default()
        });
        assert!(!is_equivalent(&a, &b));
    }

    #[test]
    fn equivalence_requires_matching_nonempty_condition() {
        let incoming = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            equivalence: Some(EquivalencePolicy::SameActiveCondition),
            ..Default::default()
        });
        let same = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            ..Default::default()
        });
        let different = Node::create(NodeSpec {
            condition: Some(Condition::Never),
            ..Default::default()
        });
        let empty = Node::create(NodeSpec::default());
        assert!(is_equivalent(&incoming, &same));
        assert!(!is_equivalent(&incoming, &different));
        assert!(!is_equivalent(&incoming, &empty));
    }

    #[test]
    fn equivalence_policy_of_incoming_decides() {
        let incoming = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            equivalence: Some(EquivalencePolicy::None),
            ..Default::default()
        });
        let existing = Node::create(NodeSpec {
            condition: Some(condition_fixture()),
            equivalence: Some(EquivalencePolicy::SameActiveCondition),
            ..Default::default()
        });
        assert!(!is_equivalent(&incoming, &existing));
        assert!(is_equivalent(&existing, &incoming));
    }

    #[test]
    fn reactivate_copies_edges_with_fresh_history() {
        let original = Node::create(NodeSpec {
            depends_on: vec![NodeId::from("dep-1")],
            tags: vec!["nightly".to_string()],
            condition: Some(condition_fixture()),
            ..Default::default()
        });
        let copy = original.reactivate(NodeId::from("copy-1"), None, Some("rerun".to_string()));
        assert_eq!(copy.id, NodeId::from("copy-1"));
        assert_eq!(copy.depends_on, original.depends_on);
        assert_eq!(copy.condition, original.condition);
        assert_eq!(copy.metadata.as_deref(), Some("rerun"));
        assert!(copy.history.is_passive());
    }

    #[test]
    fn stored_node_blob_roundtrip() {
        let node = Node::create(NodeSpec {
            name: Some("index-genome".to_string()),
            build_process: Some(BuildProcess::LongRunning {
                plugin: "lsf".to_string(),
                run_parameters: serde_json::json!({"queue": "normal"}),
            }),
            condition: Some(condition_fixture()),
            ..Default::default()
        });
        let stored = StoredNode::Inline(node);
        let text = encode_stored(&stored).unwrap();
        let back = decode_stored(&text).unwrap();
        assert_eq!(stored, back);

        let pointer = StoredNode::Pointer {
            id: NodeId::from("p-1"),
            points_to: NodeId::from("t-1"),
        };
        let text = encode_stored(&pointer).unwrap();
        assert_eq!(decode_stored(&text).unwrap(), pointer);
    }

    #[test]
    fn unsupported_blob_version_is_rejected() {
        let err = decode_stored(r#"{"v":99,"node":{"kind":"pointer","id":"a","points_to":"b"}}"#)
            .unwrap_err();
        assert!(matches!(err, WireError::UnsupportedVersion(99)));
    }
}
