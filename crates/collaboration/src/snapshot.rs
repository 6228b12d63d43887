/// Point-in-time session state for the persistence boundary
/// A snapshot is everything needed to resume a document: committed text,
/// version and the keyed CRDT store.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{CollaborationError, CrdtState, Document, DocumentId, Result, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: DocumentId,

    /// Session that produced the snapshot
    pub session_id: SessionId,

    /// Number of operations committed into `content`
    pub version: u64,

    pub content: Document,

    #[serde(default)]
    pub crdt_states: BTreeMap<String, CrdtState>,

    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Empty document at version zero
    pub fn empty(document_id: DocumentId) -> Self {
        Self {
            document_id,
            session_id: SessionId::new(),
            version: 0,
            content: Document::new(),
            crdt_states: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Directory of snapshot files, one per document
pub struct SnapshotStore {
    storage_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, document_id: &DocumentId) -> PathBuf {
        // Keep arbitrary document IDs inside the storage directory
        let name: String = document_id
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.storage_dir.join(format!("snapshot_{}.json", name))
    }

    /// Write a snapshot, replacing any previous one for the document
    pub async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| io_error("create storage directory", e))?;

        let path = self.path_for(&snapshot.document_id);
        fs::write(&path, snapshot.to_bytes()?)
            .await
            .map_err(|e| io_error("write snapshot", e))?;

        tracing::debug!(
            document_id = %snapshot.document_id,
            version = snapshot.version,
            path = %path.display(),
            "Saved snapshot"
        );
        Ok(path)
    }

    /// Load the latest snapshot for a document, if one was saved
    pub async fn load(&self, document_id: &DocumentId) -> Result<Option<Snapshot>> {
        let path = self.path_for(document_id);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat snapshot", e))?
        {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| io_error("read snapshot", e))?;
        Snapshot::from_bytes(&bytes).map(Some)
    }

    pub async fn delete(&self, document_id: &DocumentId) -> Result<()> {
        let path = self.path_for(document_id);
        if fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat snapshot", e))?
        {
            fs::remove_file(&path)
                .await
                .map_err(|e| io_error("delete snapshot", e))?;
        }
        Ok(())
    }
}

fn io_error(action: &str, err: std::io::Error) -> CollaborationError {
    CollaborationError::Serialization(format!("Failed to {}: {}", action, err))
}
