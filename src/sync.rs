//! Store mirroring between database URIs and backup directories.
//!
//! Two URI schemes are understood: `backup:<dir>` mirrors every stored
//! node into one `<id>.json` file (in subdirectories of at most
//! [`BACKUP_FILES_PER_DIR`] files), and anything else is treated as a
//! native database URI. `copy` streams all stored nodes from source to
//! destination, preserving pointers and engine statuses.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::StoredNode;
use crate::store::{EngineStatus, Store};

/// Upper bound on files per backup subdirectory.
pub const BACKUP_FILES_PER_DIR: usize = 100;

const BACKUP_SCHEME: &str = "backup:";
const BACKUP_VERSION: u32 = 1;

// ============================================================================
// Endpoints
// ============================================================================

/// Where a sync endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEndpoint {
    Backup(PathBuf),
    Database(String),
}

impl SyncEndpoint {
    pub fn parse(uri: &str) -> Self {
        match uri.strip_prefix(BACKUP_SCHEME) {
            Some(dir) => SyncEndpoint::Backup(PathBuf::from(dir)),
            None => SyncEndpoint::Database(uri.to_string()),
        }
    }
}

/// Sync failures always carry both endpoints plus the cause.
#[derive(Debug, Error)]
#[error("sync {src} -> {dst} failed: {cause}")]
pub struct SyncError {
    pub src: String,
    pub dst: String,
    pub cause: String,
}

type RowSet = Vec<(StoredNode, EngineStatus)>;

// ============================================================================
// Backup layout
// ============================================================================

/// On-disk record: versioned so the layout can migrate.
#[derive(Debug, Serialize, Deserialize)]
struct BackupRecord {
    v: u32,
    engine_status: String,
    node: StoredNode,
}

async fn read_backup(dir: &Path) -> Result<RowSet, String> {
    let mut rows = RowSet::new();
    let mut outer = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| format!("read_dir {}: {e}", dir.display()))?;
    let mut subdirs = Vec::new();
    while let Some(entry) = outer.next_entry().await.map_err(|e| e.to_string())? {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    subdirs.sort();
    for subdir in subdirs {
        let mut inner = tokio::fs::read_dir(&subdir)
            .await
            .map_err(|e| format!("read_dir {}: {e}", subdir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = inner.next_entry().await.map_err(|e| e.to_string())? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        for file in files {
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| format!("read {}: {e}", file.display()))?;
            let record: BackupRecord = serde_json::from_str(&text)
                .map_err(|e| format!("parse {}: {e}", file.display()))?;
            if record.v != BACKUP_VERSION {
                return Err(format!(
                    "unsupported backup version {} in {}",
                    record.v,
                    file.display()
                ));
            }
            let status = EngineStatus::parse(&record.engine_status)
                .ok_or_else(|| format!("bad engine status in {}", file.display()))?;
            rows.push((record.node, status));
        }
    }
    Ok(rows)
}

async fn write_backup(dir: &Path, rows: &RowSet) -> Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("create {}: {e}", dir.display()))?;
    for (index, (stored, status)) in rows.iter().enumerate() {
        let bucket = dir.join(format!("{:03}", index / BACKUP_FILES_PER_DIR));
        tokio::fs::create_dir_all(&bucket)
            .await
            .map_err(|e| format!("create {}: {e}", bucket.display()))?;
        let record = BackupRecord {
            v: BACKUP_VERSION,
            engine_status: status.as_str().to_string(),
            node: stored.clone(),
        };
        let text = serde_json::to_string_pretty(&record).map_err(|e| e.to_string())?;
        let file = bucket.join(format!("{}.json", stored.id()));
        tokio::fs::write(&file, text)
            .await
            .map_err(|e| format!("write {}: {e}", file.display()))?;
    }
    Ok(())
}

// ============================================================================
// Copy
// ============================================================================

async fn read_rows(endpoint: &SyncEndpoint) -> Result<RowSet, String> {
    match endpoint {
        SyncEndpoint::Backup(dir) => read_backup(dir).await,
        SyncEndpoint::Database(uri) => {
            let store = Store::open(uri).await.map_err(|e| e.to_string())?;
            let rows = store.export_rows().await.map_err(|e| e.to_string())?;
            store.close().await.map_err(|e| e.to_string())?;
            Ok(rows)
        }
    }
}

async fn write_rows(endpoint: &SyncEndpoint, rows: &RowSet) -> Result<(), String> {
    match endpoint {
        SyncEndpoint::Backup(dir) => write_backup(dir, rows).await,
        SyncEndpoint::Database(uri) => {
            let store = Store::open(uri).await.map_err(|e| e.to_string())?;
            for (stored, status) in rows {
                store
                    .force_insert(stored, *status)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            store.close().await.map_err(|e| e.to_string())?;
            Ok(())
        }
    }
}

/// Stream every stored node from `src` to `dst`. Returns the number of
/// nodes copied.
pub async fn copy(src: &str, dst: &str) -> Result<u64, SyncError> {
    let err = |cause: String| SyncError {
        src: src.to_string(),
        dst: dst.to_string(),
        cause,
    };
    let src_endpoint = SyncEndpoint::parse(src);
    let dst_endpoint = SyncEndpoint::parse(dst);
    let rows = read_rows(&src_endpoint).await.map_err(err)?;
    let count = rows.len() as u64;
    write_rows(&dst_endpoint, &rows)
        .await
        .map_err(|cause| SyncError {
            src: src.to_string(),
            dst: dst.to_string(),
            cause,
        })?;
    info!(src, dst, count, "sync complete");
    Ok(count)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeId, NodeSpec};

    #[test]
    fn endpoint_parse_distinguishes_schemes() {
        assert_eq!(
            SyncEndpoint::parse("backup:/var/backups/gantry"),
            SyncEndpoint::Backup(PathBuf::from("/var/backups/gantry"))
        );
        assert_eq!(
            SyncEndpoint::parse("sqlite://engine.db"),
            SyncEndpoint::Database("sqlite://engine.db".to_string())
        );
    }

    #[tokio::test]
    async fn store_to_backup_roundtrip() {
        let store = Store::open("sqlite::memory:").await.unwrap();
        let target = Node::create(NodeSpec {
            name: Some("t".to_string()),
            ..Default::default()
        });
        store.force_insert_passive(&target).await.unwrap();
        store
            .force_insert(
                &StoredNode::Pointer {
                    id: NodeId::from("p"),
                    points_to: target.id.clone(),
                },
                EngineStatus::Finished,
            )
            .await
            .unwrap();
        let rows = store.export_rows().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), &rows).await.unwrap();
        let back = read_backup(dir.path()).await.unwrap();
        assert_eq!(back.len(), 2);
        let (pointer, status) = back
            .iter()
            .find(|(s, _)| s.id() == &NodeId::from("p"))
            .unwrap();
        assert!(matches!(pointer, StoredNode::Pointer { .. }));
        assert_eq!(*status, EngineStatus::Finished);
    }

    #[tokio::test]
    async fn backup_splits_into_bounded_subdirectories() {
        let rows: RowSet = (0..230)
            .map(|i| {
                let node = Node::create(NodeSpec {
                    id: Some(NodeId::from(format!("n-{i:04}").as_str())),
                    ..Default::default()
                });
                (StoredNode::Inline(node), EngineStatus::Passive)
            })
            .collect();
        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), &rows).await.unwrap();

        let mut subdirs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        subdirs.sort();
        assert_eq!(subdirs.len(), 3);
        for subdir in &subdirs {
            let files = std::fs::read_dir(subdir).unwrap().count();
            assert!(files <= BACKUP_FILES_PER_DIR);
        }
        let back = read_backup(dir.path()).await.unwrap();
        assert_eq!(back.len(), 230);
    }

    #[tokio::test]
    async fn copy_reports_both_uris_on_failure() {
        let err = copy("backup:/does/not/exist", "sqlite::memory:")
            .await
            .unwrap_err();
        assert_eq!(err.src, "backup:/does/not/exist");
        assert_eq!(err.dst, "sqlite::memory:");
        assert!(!err.cause.is_empty());
    }
}
