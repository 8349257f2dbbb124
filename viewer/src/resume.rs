//! Resume store: a single persisted playback position.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::watch;

/// Last confirmed playback position.
///
/// Serialized as `{"bucketTime": ..., "assetId": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    #[serde(rename = "bucketTime")]
    pub bucket_id: String,
    pub asset_id: String,
}

impl ResumeRecord {
    pub fn new(bucket_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            asset_id: asset_id.into(),
        }
    }
}

/// Single-slot persistence for the playback position.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load(&self) -> Result<Option<ResumeRecord>>;

    /// Overwrites any previous record.
    async fn save(&self, record: &ResumeRecord) -> Result<()>;

    /// Forget the saved position. A later `load` returns `None`.
    async fn clear(&self) -> Result<()>;
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    slot: Mutex<Option<ResumeRecord>>,
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn load(&self) -> Result<Option<ResumeRecord>> {
        Ok(self.lock()?.clone())
    }

    async fn save(&self, record: &ResumeRecord) -> Result<()> {
        *self.lock()? = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.lock()? = None;
        Ok(())
    }
}

impl MemoryResumeStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<ResumeRecord>>> {
        self.slot
            .lock()
            .map_err(|_| anyhow::anyhow!("resume slot poisoned"))
    }
}

/// JSON file holding one record.
#[derive(Debug, Clone)]
pub struct FileResumeStore {
    path: PathBuf,
}

impl FileResumeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "resume".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn load(&self) -> Result<Option<ResumeRecord>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read resume file"),
        };
        match serde_json::from_str(&json) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // An unreadable record only costs the saved position.
                tracing::warn!("Ignoring corrupt resume file {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &ResumeRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create resume directory")?;
        }

        // Replace atomically; readers never see a partial record.
        let tmp = self.temp_path();
        let json = serde_json::to_string(record).context("Failed to serialize resume record")?;
        fs::write(&tmp, json)
            .await
            .context("Failed to write resume file")?;
        fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace resume file")?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove resume file"),
        }
    }
}

/// Saves positions off the caller's task.
///
/// Only the latest record is kept; a save requested while another is being
/// written replaces any earlier pending one. Failures are logged.
#[derive(Debug, Clone)]
pub struct ResumeWriter {
    tx: Arc<watch::Sender<Option<ResumeRecord>>>,
}

impl ResumeWriter {
    pub fn spawn(store: Arc<dyn ResumeStore>) -> Self {
        let (tx, mut rx) = watch::channel(None::<ResumeRecord>);

        tokio::spawn(async move {
            // Ends once every writer is dropped and the last record is flushed.
            while rx.changed().await.is_ok() {
                let latest = rx.borrow_and_update().clone();
                let Some(record) = latest else {
                    continue;
                };
                if let Err(e) = store.save(&record).await {
                    tracing::warn!("Failed to save resume record: {:#}", e);
                }
            }
        });

        Self { tx: Arc::new(tx) }
    }

    pub fn save(&self, record: ResumeRecord) {
        self.tx.send_replace(Some(record));
    }
}
