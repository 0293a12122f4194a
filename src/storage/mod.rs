//! Scratch storage
//!
//! Ephemeral directories backing executions (`ScratchSpace`) and the
//! cross-node handoff of compiled artifacts (`SharedScratchSpace`).

pub mod janitor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::JudgeId;
use crate::error::StorageError;

pub use janitor::Janitor;

const PREFIX: &str = "judge";

/// Node-local scratch directory, preferring a RAM-backed mount.
///
/// Clones share one directory. Closing deletes it recursively; closing twice
/// is a no-op and `path()` after close fails.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    inner: Arc<ScratchInner>,
}

#[derive(Debug)]
struct ScratchInner {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl ScratchSpace {
    pub fn create_local(ramdisk_root: &Path) -> Result<Self> {
        let base = if ramdisk_root.is_dir() {
            ramdisk_root.to_path_buf()
        } else {
            std::env::temp_dir()
        };

        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(&base)
            .with_context(|| format!("Failed to create scratch space under {:?}", base))?;
        debug!("Created scratch space {:?}", dir.path());

        Ok(Self {
            inner: Arc::new(ScratchInner {
                path: dir.path().to_path_buf(),
                dir: Mutex::new(Some(dir)),
            }),
        })
    }

    pub fn path(&self) -> Result<&Path, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed(self.inner.path.clone()));
        }
        Ok(&self.inner.path)
    }

    pub fn is_closed(&self) -> bool {
        self.dir().is_none()
    }

    pub fn close(&self) -> Result<()> {
        let dir = self.dir().take();
        if let Some(dir) = dir {
            dir.close()
                .with_context(|| format!("Failed to delete scratch space {:?}", self.inner.path))?;
            debug!("Deleted scratch space {:?}", self.inner.path);
        }
        Ok(())
    }

    fn dir(&self) -> MutexGuard<'_, Option<TempDir>> {
        self.inner.dir.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scratch directory under a storage root every worker node can reach.
///
/// The directory outlives the handle; only `close` deletes it. A handle
/// can be re-attached on another node from the path alone.
#[derive(Debug, Clone)]
pub struct SharedScratchSpace {
    inner: Arc<SharedInner>,
}

#[derive(Debug)]
struct SharedInner {
    path: PathBuf,
    closed: AtomicBool,
}

impl SharedScratchSpace {
    /// Provision `<root>/tmp/judgeXXXX`
    pub fn create(root: &Path) -> Result<Self> {
        let parent = root.join("tmp");
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create shared storage parent {:?}", parent))?;

        let path = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(&parent)
            .with_context(|| format!("Failed to create shared scratch space under {:?}", parent))?
            .keep();
        debug!("Created shared scratch space {:?}", path);

        Ok(Self::from_path(path))
    }

    /// Handle to a directory created by [`SharedScratchSpace::create`], possibly on another node
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            anyhow::bail!("Shared scratch space {:?} is not reachable", path);
        }
        Ok(Self::from_path(path))
    }

    fn from_path(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                path,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> Result<&Path, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed(self.inner.path.clone()));
        }
        Ok(&self.inner.path)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.inner.path) {
            Ok(()) => {
                debug!("Deleted shared scratch space {:?}", self.inner.path);
                Ok(())
            }
            // Another node already released it
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to delete shared scratch space {:?}", self.inner.path)
            }),
        }
    }
}

/// Scratch spaces grouped by the judge that created them
#[derive(Debug, Default)]
pub struct ScratchRegistry {
    spaces: Mutex<HashMap<JudgeId, Vec<ScratchSpace>>>,
}

impl ScratchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: JudgeId, space: &ScratchSpace) {
        let mut spaces = self.lock();
        let owned = spaces.entry(owner).or_default();
        owned.retain(|s| !s.is_closed());
        owned.push(space.clone());
    }

    /// Number of still-open spaces owned by `owner`
    #[cfg(test)]
    pub fn live(&self, owner: &JudgeId) -> usize {
        self.lock()
            .get(owner)
            .map(|owned| owned.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Close every space owned by `owner`
    pub fn release(&self, owner: &JudgeId) -> Result<usize> {
        let owned = self.lock().remove(owner).unwrap_or_default();
        let mut closed = 0;
        let mut failures = Vec::new();

        for space in owned.into_iter().filter(|s| !s.is_closed()) {
            match space.close() {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!("Failed to release scratch space of judge {}: {:#}", owner, e);
                    failures.push(e);
                }
            }
        }

        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(closed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JudgeId, Vec<ScratchSpace>>> {
        self.spaces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
