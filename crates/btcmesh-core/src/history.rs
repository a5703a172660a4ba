//! Persistent broadcast history.
//!
//! Every terminal outcome the relay produces is appended to a small JSON
//! document so operators can audit what crossed the mesh. Sessions
//! themselves are never persisted; this is a record, not a recovery log.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Schema version of the history document.
const HISTORY_VERSION: u32 = 1;

/// One completed relay attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// RFC 3339 completion time.
    pub timestamp: String,
    /// Session id the chunks arrived under.
    pub session_id: String,
    /// Pinned sender node id.
    pub sender: String,
    /// `"success"` or `"failed"`.
    pub status: String,
    /// Transaction id, for successful broadcasts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    /// Failure detail, for failed sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    /// Entry for a successful broadcast.
    pub fn success(session_id: &str, sender: &str, txid: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            status: "success".to_string(),
            txid: Some(txid.to_string()),
            error: None,
        }
    }

    /// Entry for a failed session.
    pub fn failure(session_id: &str, sender: &str, error: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            status: "failed".to_string(),
            txid: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    version: u32,
    transactions: Vec<HistoryEntry>,
}

impl Default for HistoryDocument {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            transactions: Vec::new(),
        }
    }
}

/// Append-only history file, newest entry first.
pub struct BroadcastHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BroadcastHistory {
    /// Use (and create if needed) the history file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Record one entry.
    pub async fn record(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await;
        document.transactions.insert(0, entry);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Config(format!("history dir: {e}")))?;
        }
        let data = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::Config(format!("history encode: {e}")))?;
        tokio::fs::write(&self.path, data)
            .await
            .map_err(|e| Error::Config(format!("history write: {e}")))
    }

    /// All recorded entries, newest first. A missing or corrupt file reads
    /// as empty.
    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.load().await.transactions
    }

    async fn load(&self) -> HistoryDocument {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(_) => HistoryDocument::default(),
        }
    }
}
