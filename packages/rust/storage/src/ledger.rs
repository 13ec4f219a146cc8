//! Document-id ledger: a flat JSON object `file_name -> document_id`.
//!
//! The file is created lazily on first access. All reads and writes go
//! through one async mutex, and every write replaces the file atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use refkb_shared::{RefKbError, Result};
use tokio::sync::Mutex;
use tracing::debug;

/// Persisted mapping from uploaded file identity to remote document id.
#[derive(Debug)]
pub struct DocumentLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DocumentLedger {
    /// Bind a ledger to `path`. No I/O happens until first use.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, identity: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(identity))
    }

    /// Record `identity -> document_id`; last write wins.
    pub async fn set(&self, identity: &str, document_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(identity.to_string(), document_id.to_string());
        self.persist(&entries).await?;
        debug!(%identity, %document_id, "ledger entry written");
        Ok(())
    }

    pub async fn entries(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Read the file, creating it as `{}` if absent. Caller holds the lock.
    async fn load(&self) -> Result<BTreeMap<String, String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let empty = BTreeMap::new();
                self.persist(&empty).await?;
                return Ok(empty);
            }
            Err(e) => return Err(RefKbError::io(&self.path, e)),
        };

        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            RefKbError::Storage(format!("corrupt ledger {}: {e}", self.path.display()))
        })
    }

    /// Write to a sibling temp file, then rename over the ledger.
    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RefKbError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| RefKbError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| RefKbError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RefKbError::io(&self.path, e))
    }
}
