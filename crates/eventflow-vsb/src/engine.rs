//! Volume-level block engine.
//!
//! The engine owns everything under `volume.dir/block`: it discovers block
//! files at startup, recovers their tail state, creates and removes blocks,
//! and delivers archived notifications. Notifications go through a bounded
//! queue drained by a dedicated task so a slow listener can never stall an
//! append or apply path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use eventflow_core::BlockId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::block::Block;
use crate::config::VsbConfig;
use crate::error::{Result, VsbError};

/// Callback invoked (from the drain task) after a block is archived.
pub type ArchivedListener = Box<dyn Fn(BlockId) + Send + Sync>;

pub struct Engine {
    dir: PathBuf,
    config: VsbConfig,
    blocks: Mutex<HashMap<BlockId, Arc<Block>>>,
    archived_tx: mpsc::Sender<BlockId>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open (creating if needed) the block directory and start the
    /// archived-listener drain task.
    pub async fn load(
        dir: impl AsRef<Path>,
        config: VsbConfig,
        listener: Option<ArchivedListener>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let (archived_tx, mut archived_rx) =
            mpsc::channel::<BlockId>(config.listener_queue_depth.max(1));
        let drain = tokio::spawn(async move {
            while let Some(id) = archived_rx.recv().await {
                if let Some(listener) = &listener {
                    listener(id);
                }
            }
        });

        Ok(Self {
            dir,
            config,
            blocks: Mutex::new(HashMap::new()),
            archived_tx,
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Discover and open every `*.vsb` file in the directory.
    ///
    /// A file whose header fails to decode is quarantined: renamed with a
    /// `.corrupt` suffix, logged at `error`, and excluded from the result.
    /// Recovery of the rest proceeds.
    pub async fn recover(&self) -> Result<HashMap<BlockId, Arc<Block>>> {
        let mut out = HashMap::new();
        let mut dirents = tokio::fs::read_dir(&self.dir).await?;
        while let Some(dirent) = dirents.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("vsb") {
                continue;
            }
            let Some(id) = block_id_from_path(&path) else {
                warn!(path = %path.display(), "skipping file with unparsable block id");
                continue;
            };
            match Block::open(&path, &self.config, Some(self.archived_tx.clone())).await {
                Ok(block) => {
                    info!(
                        block_id = %id,
                        last_offset = block.last_offset(),
                        state = ?block.state(),
                        "block recovered"
                    );
                    out.insert(id, Arc::new(block));
                }
                Err(VsbError::CorruptHeader(msg)) => {
                    error!(
                        block_id = %id,
                        path = %path.display(),
                        reason = %msg,
                        "corrupt block header, quarantining"
                    );
                    let quarantined = path.with_extension("vsb.corrupt");
                    if let Err(e) = tokio::fs::rename(&path, &quarantined).await {
                        error!(path = %path.display(), error = %e, "quarantine rename failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let mut blocks = self.blocks.lock().unwrap();
        for (id, block) in &out {
            blocks.insert(*id, block.clone());
        }
        Ok(out)
    }

    /// Create a new block file named `<id>.vsb`.
    pub async fn create(&self, id: BlockId, capacity: u64) -> Result<Arc<Block>> {
        let path = self.path_of(id);
        let block = Arc::new(
            Block::create(
                &path,
                id,
                capacity,
                &self.config,
                Some(self.archived_tx.clone()),
            )
            .await?,
        );
        self.blocks.lock().unwrap().insert(id, block.clone());
        info!(block_id = %id, capacity, "block created");
        Ok(block)
    }

    pub fn get(&self, id: BlockId) -> Option<Arc<Block>> {
        self.blocks.lock().unwrap().get(&id).cloned()
    }

    /// Re-open a block whose file was replaced on disk (snapshot install).
    /// The fresh handle supersedes the old one in the engine's map; holders
    /// of the old `Arc` keep reading the unlinked inode.
    pub async fn reopen(&self, id: BlockId) -> Result<Arc<Block>> {
        let path = self.path_of(id);
        let block = Arc::new(
            Block::open(&path, &self.config, Some(self.archived_tx.clone())).await?,
        );
        self.blocks.lock().unwrap().insert(id, block.clone());
        info!(block_id = %id, last_offset = block.last_offset(), "block reopened");
        Ok(block)
    }

    /// Delete a block and forget it. Unknown ids are a no-op.
    pub async fn remove(&self, id: BlockId) -> Result<()> {
        let block = self.blocks.lock().unwrap().remove(&id);
        if let Some(block) = block {
            block.delete().await?;
            info!(block_id = %id, "block removed");
        }
        Ok(())
    }

    /// Flush all working blocks and stop the listener drain task.
    /// Idempotent.
    pub async fn close(&self) {
        let blocks: Vec<Arc<Block>> = self.blocks.lock().unwrap().values().cloned().collect();
        for block in blocks {
            if let Err(e) = block.flush().await {
                warn!(block_id = %block.id(), error = %e, "flush on close failed");
            }
        }
        let handle = self.drain.lock().unwrap().take();
        if let Some(handle) = handle {
            // Closing our sender is not enough while blocks hold clones;
            // abort is fine, the queue carries only notifications.
            handle.abort();
            let _ = handle.await;
        }
    }

    fn path_of(&self, id: BlockId) -> PathBuf {
        self.dir.join(format!("{id}.vsb"))
    }
}

fn block_id_from_path(path: &Path) -> Option<BlockId> {
    let stem = path.file_stem()?.to_str()?;
    u64::from_str_radix(stem, 16).ok().map(BlockId::from_u64)
}
