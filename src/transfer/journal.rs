//! Durable record of in-flight transfers.
//!
//! Every state change of an active transfer is journaled before it is
//! published, so a restarted coordinator can find transfers that were cut
//! short and clean up after them.
//!
//! # Storage Layout
//!
//! ```text
//! transfers/
//!   ├── active/
//!   │   └── transfer_<uuid>.bin
//!   └── completed/
//!       └── transfer_<uuid>.bin
//! ```

use crate::error::{Error, Result};
use crate::transfer::types::{ShardTransfer, TransferId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage for transfer records.
#[async_trait]
pub trait TransferJournal: Send + Sync + std::fmt::Debug {
    /// Create or update an active transfer.
    async fn save(&self, transfer: &ShardTransfer) -> Result<()>;

    /// Move a finalized transfer out of the active set.
    async fn archive(&self, transfer: &ShardTransfer) -> Result<()>;

    /// Every transfer still marked active.
    async fn load_active(&self) -> Result<Vec<ShardTransfer>>;

    /// Archived transfers, oldest first.
    async fn load_archived(&self) -> Result<Vec<ShardTransfer>>;
}

/// In-memory journal for tests and single-process clusters.
#[derive(Debug, Default)]
pub struct InMemoryTransferJournal {
    active: RwLock<HashMap<TransferId, ShardTransfer>>,
    archived: RwLock<Vec<ShardTransfer>>,
}

impl InMemoryTransferJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferJournal for InMemoryTransferJournal {
    async fn save(&self, transfer: &ShardTransfer) -> Result<()> {
        self.active.write().insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn archive(&self, transfer: &ShardTransfer) -> Result<()> {
        self.active.write().remove(&transfer.id);
        self.archived.write().push(transfer.clone());
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<ShardTransfer>> {
        let mut transfers: Vec<_> = self.active.read().values().cloned().collect();
        transfers.sort_by_key(|t| t.started_at);
        Ok(transfers)
    }

    async fn load_archived(&self) -> Result<Vec<ShardTransfer>> {
        Ok(self.archived.read().clone())
    }
}

/// Journal backed by one bincode file per transfer.
#[derive(Debug)]
pub struct FileTransferJournal {
    base_dir: PathBuf,
}

impl FileTransferJournal {
    /// Open (creating directories as needed) a journal under `base_dir`.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(base_dir.join("active")).await?;
        fs::create_dir_all(base_dir.join("completed")).await?;
        Ok(Self { base_dir })
    }

    fn active_path(&self, id: TransferId) -> PathBuf {
        self.base_dir
            .join("active")
            .join(format!("transfer_{}.bin", id))
    }

    fn archive_path(&self, id: TransferId) -> PathBuf {
        self.base_dir
            .join("completed")
            .join(format!("transfer_{}.bin", id))
    }

    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_dir(&self, sub: &str) -> Result<Vec<ShardTransfer>> {
        let mut transfers = Vec::new();
        let mut entries = fs::read_dir(self.base_dir.join(sub)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "bin").unwrap_or(true) {
                continue;
            }
            let content = fs::read(&path).await?;
            match bincode::deserialize::<ShardTransfer>(&content) {
                Ok(transfer) => transfers.push(transfer),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable journal entry"
                    );
                }
            }
        }

        transfers.sort_by_key(|t| t.started_at);
        Ok(transfers)
    }
}

#[async_trait]
impl TransferJournal for FileTransferJournal {
    async fn save(&self, transfer: &ShardTransfer) -> Result<()> {
        let content = bincode::serialize(transfer)
            .map_err(|e| Error::Internal(format!("journal encode: {}", e)))?;
        self.atomic_write(&self.active_path(transfer.id), &content)
            .await?;

        tracing::debug!(
            transfer_id = %transfer.id,
            shard = %transfer.key,
            state = %transfer.state,
            "Journaled transfer"
        );
        Ok(())
    }

    async fn archive(&self, transfer: &ShardTransfer) -> Result<()> {
        let content = bincode::serialize(transfer)
            .map_err(|e| Error::Internal(format!("journal encode: {}", e)))?;
        self.atomic_write(&self.archive_path(transfer.id), &content)
            .await?;

        match fs::remove_file(self.active_path(transfer.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_active(&self) -> Result<Vec<ShardTransfer>> {
        self.read_dir("active").await
    }

    async fn load_archived(&self) -> Result<Vec<ShardTransfer>> {
        self.read_dir("completed").await
    }
}
