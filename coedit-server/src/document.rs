//! Authoritative document state and its on-disk persistence.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use diffy::Patch;
use tokio::fs;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

/// Content installed when no document exists on disk yet.
pub const DEFAULT_CONTENT: &str =
    "<h1>Untitled document</h1><p>This document is shared with everyone who has the link.</p>";

/// Banner replacing a persisted document that breaches the size cap.
const OVERSIZE_BANNER: &str =
    "<p>The previous document exceeded the size limit and could not be loaded.</p>";

/// Result of attempting to apply a patch to the document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch produced the current content exactly.
    NoChange,
    /// The patch was committed; carries the new size in bytes.
    Applied(usize),
    /// One or more hunks did not apply; the document is unchanged.
    Failed(String),
    /// The result would breach the size cap; the document is unchanged.
    Rejected(String),
}

struct DocState {
    content: String,
    dirty: bool,
}

/// Owns the canonical document string and the file backing it.
///
/// All mutations go through [`DocumentStore::apply_patch_then`] and are
/// serialized by a write lock; readers see consistent snapshots.
pub struct DocumentStore {
    state: RwLock<DocState>,
    path: PathBuf,
    max_bytes: usize,
    /// Gates re-entry while a save is writing the file.
    saving: AtomicBool,
    changed: Notify,
}

impl DocumentStore {
    /// Create a store for the document at `path`, capped at `max_bytes`.
    pub fn new(path: PathBuf, max_bytes: usize) -> Self {
        Self {
            state: RwLock::new(DocState {
                content: DEFAULT_CONTENT.to_string(),
                dirty: false,
            }),
            path,
            max_bytes,
            saving: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Path of the persisted file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted document into memory.
    ///
    /// A missing file is initialized with the default content and written
    /// back; a file over the size cap is not read and is overwritten with a
    /// human-readable banner.
    pub async fn load(&self) -> Result<()> {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.len() > self.max_bytes as u64 => {
                warn!(
                    "persisted document is {} bytes, over the {} byte cap; replacing with banner",
                    meta.len(),
                    self.max_bytes
                );
                self.state.write().await.content = OVERSIZE_BANNER.to_string();
                if let Err(e) = write_atomic(&self.path, OVERSIZE_BANNER).await {
                    warn!("failed to overwrite oversize document: {:#}", e);
                }
            }
            Ok(_) => {
                let content = fs::read_to_string(&self.path)
                    .await
                    .context("Failed to read document")?;
                self.state.write().await.content = content;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "no document at {}, writing default content",
                    self.path.display()
                );
                if let Some(parent) = self.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create document directory")?;
                }
                write_atomic(&self.path, DEFAULT_CONTENT).await?;
            }
            Err(e) => return Err(e).context("Failed to stat document"),
        }
        Ok(())
    }

    /// Apply a unified-diff patch to the document.
    ///
    /// On `Applied`, `broadcast` runs before the document lock is released,
    /// so fan-out order matches commit order.
    pub async fn apply_patch_then<F>(&self, patch: &str, broadcast: F) -> PatchOutcome
    where
        F: FnOnce(usize),
    {
        let parsed = match Patch::from_str(patch) {
            Ok(parsed) => parsed,
            Err(e) => return PatchOutcome::Failed(format!("patch apply failed: {e}")),
        };
        let mut state = self.state.write().await;
        let next = match diffy::apply(&state.content, &parsed) {
            Ok(next) => next,
            Err(e) => return PatchOutcome::Failed(format!("patch apply failed: {e}")),
        };
        if next.len() > self.max_bytes {
            return PatchOutcome::Rejected(format!(
                "document size limit exceeded: {} > {} bytes",
                next.len(),
                self.max_bytes
            ));
        }
        if next == state.content {
            return PatchOutcome::NoChange;
        }
        let size = next.len();
        state.content = next;
        state.dirty = true;
        broadcast(size);
        drop(state);
        self.changed.notify_waiters();
        PatchOutcome::Applied(size)
    }

    /// Apply a unified-diff patch without a broadcast hook.
    pub async fn apply_patch(&self, patch: &str) -> PatchOutcome {
        self.apply_patch_then(patch, |_| {}).await
    }

    /// Current document content.
    pub async fn snapshot(&self) -> String {
        self.state.read().await.content.clone()
    }

    /// Take the content for saving if it changed since the last take.
    ///
    /// Read-and-clear in one critical section so a commit between the check
    /// and the reset cannot be lost.
    pub async fn dirty_snapshot(&self) -> Option<String> {
        let mut state = self.state.write().await;
        if state.dirty {
            state.dirty = false;
            Some(state.content.clone())
        } else {
            None
        }
    }

    /// Re-flag the document as unsaved after a failed write.
    pub async fn mark_dirty(&self) {
        self.state.write().await.dirty = true;
    }

    /// Resolves after the next committed mutation.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Blocking write of the current content to disk.
    ///
    /// Must run off the async runtime (`spawn_blocking`). A save already in
    /// flight suppresses this one.
    pub fn save_sync(&self) -> Result<()> {
        if self.saving.swap(true, Ordering::Acquire) {
            return Ok(());
        }
        let result = (|| {
            let content = {
                let mut state = self.state.blocking_write();
                if state.content.len() > self.max_bytes {
                    bail!(
                        "refusing to persist oversize document ({} bytes)",
                        state.content.len()
                    );
                }
                state.dirty = false;
                state.content.clone()
            };
            write_atomic_sync(&self.path, &content)
        })();
        self.saving.store(false, Ordering::Release);
        result
    }

    /// Persist one snapshot taken at entry, off the async runtime.
    ///
    /// No lock is held across the write. If another save is in flight, the
    /// document is re-flagged dirty and the next scheduler pass retries.
    pub async fn save_async(&self, content: String) -> Result<()> {
        if content.len() > self.max_bytes {
            bail!(
                "refusing to persist oversize document ({} bytes)",
                content.len()
            );
        }
        if self.saving.swap(true, Ordering::Acquire) {
            self.mark_dirty().await;
            return Ok(());
        }
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic_sync(&path, &content)).await;
        self.saving.store(false, Ordering::Release);
        result.context("save task panicked")?
    }
}

/// Write `content` to `path` through a temporary sibling and atomic rename.
///
/// The rename is the only step that touches the durable path; any failure
/// unlinks the temporary file and leaves the live file untouched.
fn write_atomic_sync(path: &Path, content: &str) -> Result<()> {
    let tmp = tmp_path(path);
    if let Err(e) = std::fs::write(&tmp, content) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).context("Failed to write temp file");
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).context("Failed to rename temp file");
    }
    Ok(())
}

/// Async variant of [`write_atomic_sync`], used at load time.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = tmp_path(path);
    if let Err(e) = fs::write(&tmp, content).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).context("Failed to write temp file");
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).context("Failed to rename temp file");
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
