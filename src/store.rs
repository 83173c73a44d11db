//! Relational persistence for stored nodes and the add/kill queues.
//!
//! Three tables back the engine:
//!
//! - `main(id, blob, engine_status)` — every stored node (inline or
//!   pointer) is one row; `engine_status` is the simplified status
//!   compressed to three buckets for fast filtering.
//! - `add_list(id, nodes_to_add)` — queued batches of nodes awaiting
//!   insertion by the engine loop.
//! - `kill_list(id, ids_to_kill)` — queued id-sets awaiting killing.
//!
//! Every observable change runs inside one transaction. Writes are
//! serialized by a process-wide lock; reads go through the pool
//! concurrently. Each committed change delivers exactly one
//! [`ChangeRecord`] to the cache layer.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::history::SimpleStatus;
use crate::model::{
    MAX_POINTER_HOPS, Node, NodeId, StoredNode, decode_stored, encode_stored, is_equivalent,
};

/// Immediate retries for transaction-begin failures before giving up on
/// the tick.
const CONNECT_RETRIES: usize = 3;

// ============================================================================
// Engine status
// ============================================================================

/// The simplified status compressed to the three buckets stored in the
/// `engine_status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Passive,
    Active,
    Finished,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passive => "passive",
            Self::Active => "active",
            Self::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passive" => Some(Self::Passive),
            "active" => Some(Self::Active),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn of_node(node: &Node) -> Self {
        match node.history.simplify() {
            SimpleStatus::Activable => Self::Passive,
            SimpleStatus::InProgress => Self::Active,
            SimpleStatus::Successful | SimpleStatus::Failed => Self::Finished,
        }
    }
}

// ============================================================================
// Change records
// ============================================================================

/// What the store tells the cache layer after each commit.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    /// The engine came up.
    Started,
    NewNodes(Vec<NodeId>),
    NodesChanged(Vec<NodeId>),
}

// ============================================================================
// Errors
// ============================================================================

/// Store failures, located by what was being attempted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("exec failed: {query} [{args}]: {cause}")]
    Exec {
        query: String,
        args: String,
        cause: String,
    },
    #[error("load failed for {uri}: {cause}")]
    Load { uri: String, cause: String },
    #[error("parse failed ({kind}): {cause}")]
    Parse { kind: String, cause: String },
    #[error("close failed: {cause}")]
    Close { cause: String },
    #[error("pointer chain exceeded {MAX_POINTER_HOPS} hops starting at {id}")]
    PointerChain { id: NodeId },
    #[error("node not found: {0}")]
    NotFound(NodeId),
}

impl StoreError {
    fn exec(query: &str, args: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StoreError {
        let query = query.to_string();
        let args = args.into();
        move |e| StoreError::Exec {
            query,
            args,
            cause: e.to_string(),
        }
    }

    fn parse(kind: &str, cause: impl std::fmt::Display) -> StoreError {
        StoreError::Parse {
            kind: kind.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Transient failures the engine retries next tick; everything else
    /// escalates per node.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Exec { .. } | StoreError::Load { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store
// ============================================================================

const CREATE_MAIN: &str = "CREATE TABLE IF NOT EXISTS main (\
     id TEXT PRIMARY KEY, blob TEXT NOT NULL, engine_status TEXT NOT NULL)";
const CREATE_MAIN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_main_engine_status ON main(engine_status)";
const CREATE_ADD_LIST: &str = "CREATE TABLE IF NOT EXISTS add_list (\
     id TEXT PRIMARY KEY, nodes_to_add TEXT NOT NULL)";
const CREATE_KILL_LIST: &str = "CREATE TABLE IF NOT EXISTS kill_list (\
     id TEXT PRIMARY KEY, ids_to_kill TEXT NOT NULL)";

/// Main store handle. Cheap to share behind an `Arc`; the writer mutex is
/// the single-writer discipline.
pub struct Store {
    pool: SqlitePool,
    uri: String,
    writer: Mutex<()>,
    changes_tx: mpsc::UnboundedSender<ChangeRecord>,
    changes_rx: Mutex<mpsc::UnboundedReceiver<ChangeRecord>>,
}

impl Store {
    /// Open (creating tables if needed) the store at a sqlx database URI.
    pub async fn open(uri: &str) -> StoreResult<Self> {
        // A pooled in-memory database would be one database per
        // connection; force a single connection there.
        let max_connections = if uri.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(|e| StoreError::Load {
                uri: uri.to_string(),
                cause: e.to_string(),
            })?;

        for query in [CREATE_MAIN, CREATE_MAIN_INDEX, CREATE_ADD_LIST, CREATE_KILL_LIST] {
            sqlx::query(query)
                .execute(&pool)
                .await
                .map_err(StoreError::exec(query, ""))?;
        }

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Ok(Self {
            pool,
            uri: uri.to_string(),
            writer: Mutex::new(()),
            changes_tx,
            changes_rx: Mutex::new(changes_rx),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Close the pool.
    pub async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn emit(&self, record: ChangeRecord) {
        // The receiver only disappears at shutdown.
        if self.changes_tx.send(record).is_err() {
            debug!("change feed closed, dropping record");
        }
    }

    /// Announce engine startup on the change feed.
    pub fn emit_started(&self) {
        self.emit(ChangeRecord::Started);
    }

    /// Blocking read of the next change record.
    pub async fn next_change(&self) -> Option<ChangeRecord> {
        self.changes_rx.lock().await.recv().await
    }

    async fn begin(&self) -> StoreResult<Transaction<'_, Sqlite>> {
        let mut last_err = None;
        for _ in 0..CONNECT_RETRIES {
            match self.pool.begin().await {
                Ok(tx) => return Ok(tx),
                Err(e) => last_err = Some(e),
            }
        }
        Err(StoreError::exec("BEGIN", "")(
            last_err.expect("at least one attempt"),
        ))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    async fn fetch_stored(&self, id: &NodeId) -> StoreResult<Option<StoredNode>> {
        let query = "SELECT blob FROM main WHERE id = ?";
        let row = sqlx::query(query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::exec(query, id.to_string()))?;
        row.map(|row| {
            let blob: String = row.get("blob");
            decode_stored(&blob).map_err(|e| StoreError::parse("stored-node", e))
        })
        .transpose()
    }

    /// Fetch the stored form without following pointers.
    pub async fn get_stored(&self, id: &NodeId) -> StoreResult<Option<StoredNode>> {
        self.fetch_stored(id).await
    }

    /// Fetch a node, following pointer chains up to the hop bound. A chain
    /// beyond the bound (a cycle, necessarily persistent) is fatal.
    pub async fn get(&self, id: &NodeId) -> StoreResult<Node> {
        let mut current = id.clone();
        for _ in 0..MAX_POINTER_HOPS {
            match self.fetch_stored(&current).await? {
                None => return Err(StoreError::NotFound(current)),
                Some(StoredNode::Inline(node)) => return Ok(node),
                Some(StoredNode::Pointer { points_to, .. }) => current = points_to,
            }
        }
        Err(StoreError::PointerChain { id: id.clone() })
    }

    /// Every stored row, pointers included.
    pub async fn all_visible(&self) -> StoreResult<Vec<StoredNode>> {
        let query = "SELECT blob FROM main ORDER BY rowid";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::exec(query, ""))?;
        rows.iter()
            .map(|row| {
                let blob: String = row.get("blob");
                decode_stored(&blob).map_err(|e| StoreError::parse("stored-node", e))
            })
            .collect()
    }

    /// Every row plus its status column, for mirroring.
    pub async fn export_rows(&self) -> StoreResult<Vec<(StoredNode, EngineStatus)>> {
        let query = "SELECT blob, engine_status FROM main ORDER BY rowid";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::exec(query, ""))?;
        rows.iter()
            .map(|row| {
                let blob: String = row.get("blob");
                let status: String = row.get("engine_status");
                let stored =
                    decode_stored(&blob).map_err(|e| StoreError::parse("stored-node", e))?;
                let status = EngineStatus::parse(&status)
                    .ok_or_else(|| StoreError::parse("engine-status", &status))?;
                Ok((stored, status))
            })
            .collect()
    }

    async fn nodes_with_status(&self, statuses: &[EngineStatus]) -> StoreResult<Vec<Node>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query =
            format!("SELECT blob FROM main WHERE engine_status IN ({placeholders}) ORDER BY rowid");
        let mut q = sqlx::query(&query);
        for status in statuses {
            q = q.bind(status.as_str());
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::exec(&query, ""))?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: String = row.get("blob");
            let stored = decode_stored(&blob).map_err(|e| StoreError::parse("stored-node", e))?;
            if let StoredNode::Inline(node) = stored {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// The live set: inline nodes that have not finished, in insertion
    /// order. This is also the equivalence candidate list.
    pub async fn all_active_and_passive(&self) -> StoreResult<Vec<Node>> {
        self.nodes_with_status(&[EngineStatus::Active, EngineStatus::Passive])
            .await
    }

    /// Inline nodes currently in progress.
    pub async fn active_nodes(&self) -> StoreResult<Vec<Node>> {
        self.nodes_with_status(&[EngineStatus::Active]).await
    }

    /// Visit every active node.
    pub async fn for_each_active<F>(&self, mut f: F) -> StoreResult<()>
    where
        F: FnMut(&Node),
    {
        for node in self.active_nodes().await? {
            f(&node);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    async fn upsert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        stored: &StoredNode,
        status: EngineStatus,
    ) -> StoreResult<()> {
        let blob = encode_stored(stored).map_err(|e| StoreError::parse("stored-node", e))?;
        let query = "INSERT OR REPLACE INTO main (id, blob, engine_status) VALUES (?, ?, ?)";
        sqlx::query(query)
            .bind(stored.id().as_str())
            .bind(&blob)
            .bind(status.as_str())
            .execute(&mut **tx)
            .await
            .map_err(StoreError::exec(query, stored.id().to_string()))?;
        Ok(())
    }

    /// Persist a changed node, recomputing `engine_status` from the final
    /// history, and emit exactly one change record.
    pub async fn update(&self, node: &Node) -> StoreResult<()> {
        let _writer = self.writer.lock().await;
        let mut tx = self.begin().await?;
        Self::upsert_in_tx(
            &mut tx,
            &StoredNode::Inline(node.clone()),
            EngineStatus::of_node(node),
        )
        .await?;
        tx.commit()
            .await
            .map_err(StoreError::exec("COMMIT", node.id.to_string()))?;
        self.emit(ChangeRecord::NodesChanged(vec![node.id.clone()]));
        Ok(())
    }

    /// Backdoor insertion preserving the stored form verbatim; used by the
    /// sync utility.
    pub async fn force_insert(
        &self,
        stored: &StoredNode,
        status: EngineStatus,
    ) -> StoreResult<()> {
        let _writer = self.writer.lock().await;
        let mut tx = self.begin().await?;
        Self::upsert_in_tx(&mut tx, stored, status).await?;
        tx.commit()
            .await
            .map_err(StoreError::exec("COMMIT", stored.id().to_string()))?;
        self.emit(ChangeRecord::NewNodes(vec![stored.id().clone()]));
        Ok(())
    }

    pub async fn force_insert_passive(&self, node: &Node) -> StoreResult<()> {
        self.force_insert(&StoredNode::Inline(node.clone()), EngineStatus::of_node(node))
            .await
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Queue a batch of nodes for insertion by the engine loop. The whole
    /// batch is one equivalence unit.
    pub async fn queue_adds(&self, nodes: &[Node]) -> StoreResult<String> {
        let batch_id = Uuid::new_v4().to_string();
        let payload =
            serde_json::to_string(nodes).map_err(|e| StoreError::parse("add-batch", e))?;
        let _writer = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let query = "INSERT INTO add_list (id, nodes_to_add) VALUES (?, ?)";
        sqlx::query(query)
            .bind(&batch_id)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::exec(query, batch_id.as_str()))?;
        tx.commit()
            .await
            .map_err(StoreError::exec("COMMIT", batch_id.as_str()))?;
        Ok(batch_id)
    }

    /// Queue a set of ids to kill.
    pub async fn queue_kills(&self, ids: &[NodeId]) -> StoreResult<String> {
        let batch_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(ids).map_err(|e| StoreError::parse("kill-batch", e))?;
        let _writer = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let query = "INSERT INTO kill_list (id, ids_to_kill) VALUES (?, ?)";
        sqlx::query(query)
            .bind(&batch_id)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::exec(query, batch_id.as_str()))?;
        tx.commit()
            .await
            .map_err(StoreError::exec("COMMIT", batch_id.as_str()))?;
        Ok(batch_id)
    }

    async fn queued_rows(&self, table: &str, column: &str) -> StoreResult<Vec<(String, String)>> {
        let query = format!("SELECT id, {column} FROM {table} ORDER BY rowid");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::exec(&query, ""))?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get(column)))
            .collect())
    }

    async fn fetch_stored_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &NodeId,
    ) -> StoreResult<Option<StoredNode>> {
        let query = "SELECT blob FROM main WHERE id = ?";
        let row = sqlx::query(query)
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(StoreError::exec(query, id.to_string()))?;
        row.map(|row| {
            let blob: String = row.get("blob");
            decode_stored(&blob).map_err(|e| StoreError::parse("stored-node", e))
        })
        .transpose()
    }

    async fn get_in_tx(tx: &mut Transaction<'_, Sqlite>, id: &NodeId) -> StoreResult<Node> {
        let mut current = id.clone();
        for _ in 0..MAX_POINTER_HOPS {
            match Self::fetch_stored_in_tx(tx, &current).await? {
                None => return Err(StoreError::NotFound(current)),
                Some(StoredNode::Inline(node)) => return Ok(node),
                Some(StoredNode::Pointer { points_to, .. }) => current = points_to,
            }
        }
        Err(StoreError::PointerChain { id: id.clone() })
    }

    /// Process every queued kill set: one transaction per set. Returns the
    /// ids whose history actually moved; one `NodesChanged` is emitted per
    /// set that moved anything.
    pub async fn drain_kills(&self) -> StoreResult<Vec<NodeId>> {
        let rows = self.queued_rows("kill_list", "ids_to_kill").await?;
        let mut all_moved = Vec::new();
        for (batch_id, payload) in rows {
            let ids: Vec<NodeId> =
                serde_json::from_str(&payload).map_err(|e| StoreError::parse("kill-batch", e))?;
            let _writer = self.writer.lock().await;
            let mut tx = self.begin().await?;
            let mut moved = Vec::new();
            for id in &ids {
                match Self::get_in_tx(&mut tx, id).await {
                    Ok(mut node) => {
                        if node.history.kill().is_some() {
                            Self::upsert_in_tx(
                                &mut tx,
                                &StoredNode::Inline(node.clone()),
                                EngineStatus::of_node(&node),
                            )
                            .await?;
                            moved.push(node.id.clone());
                        }
                    }
                    Err(StoreError::NotFound(id)) => {
                        warn!(node_id = %id, "kill requested for unknown node");
                    }
                    Err(other) => return Err(other),
                }
            }
            let query = "DELETE FROM kill_list WHERE id = ?";
            sqlx::query(query)
                .bind(&batch_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::exec(query, batch_id.as_str()))?;
            tx.commit()
                .await
                .map_err(StoreError::exec("COMMIT", batch_id.as_str()))?;
            if !moved.is_empty() {
                self.emit(ChangeRecord::NodesChanged(moved.clone()));
                all_moved.extend(moved);
            }
        }
        Ok(all_moved)
    }

    /// Process every queued add batch. Each incoming node either becomes
    /// an inline row or a pointer to the first equivalent node among the
    /// existing live set and the nodes already decided in this batch, in
    /// that order. Returns the stored forms, batch by batch.
    pub async fn drain_adds(&self) -> StoreResult<Vec<Vec<StoredNode>>> {
        let rows = self.queued_rows("add_list", "nodes_to_add").await?;
        let mut batches = Vec::new();
        for (batch_id, payload) in rows {
            let incoming: Vec<Node> =
                serde_json::from_str(&payload).map_err(|e| StoreError::parse("add-batch", e))?;
            // The candidate list is loaded before each batch so earlier
            // batches are visible to later ones.
            let candidates = self.all_active_and_passive().await?;

            let _writer = self.writer.lock().await;
            let mut tx = self.begin().await?;
            let mut decided: Vec<StoredNode> = Vec::with_capacity(incoming.len());
            let mut decided_inline: Vec<Node> = Vec::new();
            for node in incoming {
                let matched = candidates
                    .iter()
                    .chain(decided_inline.iter())
                    .find(|existing| is_equivalent(&node, existing))
                    .map(|existing| existing.id.clone());
                let stored = match matched {
                    Some(points_to) => {
                        debug!(node_id = %node.id, points_to = %points_to, "deduplicated as pointer");
                        StoredNode::Pointer {
                            id: node.id.clone(),
                            points_to,
                        }
                    }
                    None => {
                        decided_inline.push(node.clone());
                        StoredNode::Inline(node)
                    }
                };
                let status = match &stored {
                    StoredNode::Inline(node) => EngineStatus::of_node(node),
                    // Pointer rows are never processed by the engine loop.
                    StoredNode::Pointer { .. } => EngineStatus::Finished,
                };
                Self::upsert_in_tx(&mut tx, &stored, status).await?;
                decided.push(stored);
            }
            let query = "DELETE FROM add_list WHERE id = ?";
            sqlx::query(query)
                .bind(&batch_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::exec(query, batch_id.as_str()))?;
            tx.commit()
                .await
                .map_err(StoreError::exec("COMMIT", batch_id.as_str()))?;
            self.emit(ChangeRecord::NewNodes(
                decided.iter().map(|s| s.id().clone()).collect(),
            ));
            batches.push(decided);
        }
        Ok(batches)
    }

    /// Number of inline (non-pointer) rows.
    pub async fn inline_count(&self) -> StoreResult<u64> {
        Ok(self
            .all_visible()
            .await?
            .iter()
            .filter(|s| s.as_inline().is_some())
            .count() as u64)
    }

    /// Whether any queue has pending work.
    pub async fn queues_pending(&self) -> StoreResult<bool> {
        for table in ["add_list", "kill_list"] {
            let query = format!("SELECT COUNT(*) AS n FROM {table}");
            let row = sqlx::query(&query)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::exec(&query, ""))?;
            let n: i64 = row.get("n");
            if n > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// Tests
// ============================================================================
