//! Move or merge an arrived tree into the output root.
//!
//! * Destination absent: a single rename, retried with backoff while the
//!   filesystem reports a transient refusal (another process still holds a
//!   handle, a share briefly denies access).
//! * Destination present: every file is moved to its mirrored relative path.
//!   A name that is already taken is redirected into a `conflicts/` folder
//!   next to it, so a merge never overwrites anything and running the same
//!   merge twice is harmless.
//!
//! Afterwards the emptied source directories are removed bottom-up. Files
//! whose move failed stay where they were.
//!
//! Merges into the same destination are serialised by a per-destination lock
//! shared by every watcher holding the same [`Relocator`].

use crate::error::{is_transient, RelocateError};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the folder that receives colliding files.
pub const CONFLICTS_DIR: &str = "conflicts";

/// What a relocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relocation {
    /// Final location of every file that was moved.
    pub files: Vec<PathBuf>,
    /// Files redirected to a `conflicts/` folder.
    pub conflicts: usize,
    /// Files that could not be moved and were left in the source.
    pub failures: usize,
}

/// Moves trees into place, one destination at a time.
#[derive(Debug)]
pub struct Relocator {
    retry: RetryPolicy,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Relocator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Relocate `source` (file or directory) to `destination`.
    pub async fn relocate(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<Relocation, RelocateError> {
        let lock = self.lock_for(destination);
        let _guard = lock.lock().await;

        let source_meta = match tokio::fs::metadata(source).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RelocateError::NotFound {
                    path: source.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(RelocateError::Io {
                    path: source.to_path_buf(),
                    source: e,
                })
            }
        };

        if !exists(destination).await {
            if let Some(parent) = destination.parent() {
                create_dirs(parent).await?;
            }
            match self.move_path(source, destination).await {
                Ok(()) => {
                    info!("Moved {} → {}", source.display(), destination.display());
                    let files = if source_meta.is_dir() {
                        list_files(destination).await
                    } else {
                        vec![destination.to_path_buf()]
                    };
                    return Ok(Relocation {
                        files,
                        ..Default::default()
                    });
                }
                Err(RelocateError::Io { source: e, .. }) if is_cross_device(&e) => {
                    debug!(
                        "{} is on another device, merging file by file",
                        destination.display()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let relocation = if source_meta.is_dir() {
            self.merge_dir(source, destination).await?
        } else {
            self.merge_file(source, destination).await?
        };
        info!(
            "Merged {} → {} ({} files, {} conflicts, {} failed)",
            source.display(),
            destination.display(),
            relocation.files.len(),
            relocation.conflicts,
            relocation.failures
        );
        Ok(relocation)
    }

    async fn merge_dir(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<Relocation, RelocateError> {
        create_dirs(destination).await?;
        let mut relocation = Relocation::default();

        for file in list_files(source).await {
            let Ok(rel) = file.strip_prefix(source) else {
                continue;
            };
            let mut target = destination.join(rel);
            if let Some(parent) = target.parent() {
                if let Err(e) = create_dirs(parent).await {
                    warn!("{}", e);
                    relocation.failures += 1;
                    continue;
                }
            }
            if exists(&target).await {
                target = conflict_target(&target).await?;
                relocation.conflicts += 1;
            }
            match self.move_file(&file, &target).await {
                Ok(()) => relocation.files.push(target),
                Err(e) => {
                    warn!("Leaving {} in place: {}", file.display(), e);
                    relocation.failures += 1;
                }
            }
        }

        remove_empty_dirs(source).await;
        Ok(relocation)
    }

    async fn merge_file(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<Relocation, RelocateError> {
        let mut relocation = Relocation::default();
        let mut target = destination.to_path_buf();
        if exists(&target).await {
            target = conflict_target(&target).await?;
            relocation.conflicts = 1;
        }
        self.move_file(source, &target).await?;
        relocation.files.push(target);
        Ok(relocation)
    }

    /// Rename with retries; a cross-device error is returned untouched so the
    /// caller can fall back.
    async fn move_path(&self, from: &Path, to: &Path) -> Result<(), RelocateError> {
        let what = format!("move {}", from.display());
        self.retry_io(&what, from, |_| tokio::fs::rename(from, to))
            .await
    }

    /// Run a filesystem operation on `path`, retrying transient refusals.
    async fn retry_io<F, Fut>(&self, what: &str, path: &Path, op: F) -> Result<(), RelocateError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        self.retry
            .run(what, op, |e: &io::Error| is_transient(e))
            .await
            .map_err(|x| classify(path, x.attempts, x.error))
    }

    /// Move one file, copying across devices when a rename cannot work.
    async fn move_file(&self, from: &Path, to: &Path) -> Result<(), RelocateError> {
        match self.move_path(from, to).await {
            Err(RelocateError::Io { source, .. }) if is_cross_device(&source) => {
                let what = format!("copy {}", from.display());
                self.retry_io(&what, from, |_| async move {
                    tokio::fs::copy(from, to).await?;
                    tokio::fs::remove_file(from).await
                })
                .await
            }
            other => other,
        }
    }

    fn lock_for(&self, destination: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(
            locks
                .entry(destination.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Where a file goes when `target` is already taken:
/// `<dir>/conflicts/<name>`, then `<dir>/conflicts/<stem> (n).<ext>`.
pub async fn conflict_target(target: &Path) -> Result<PathBuf, RelocateError> {
    let dir = target
        .parent()
        .map(|p| p.join(CONFLICTS_DIR))
        .unwrap_or_else(|| PathBuf::from(CONFLICTS_DIR));
    create_dirs(&dir).await?;

    let name = target.file_name().unwrap_or_default();
    let candidate = dir.join(name);
    if !exists(&candidate).await {
        return Ok(candidate);
    }

    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1usize;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !exists(&candidate).await {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn classify(path: &Path, attempts: u32, err: io::Error) -> RelocateError {
    if err.kind() == io::ErrorKind::NotFound {
        RelocateError::NotFound {
            path: path.to_path_buf(),
        }
    } else if is_transient(&err) {
        RelocateError::TransientExhausted {
            path: path.to_path_buf(),
            attempts,
            source: err,
        }
    } else {
        RelocateError::Io {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn create_dirs(path: &Path) -> Result<(), RelocateError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| RelocateError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Every regular file below `root`, or `root` itself when it is a file.
pub async fn list_files(root: &Path) -> Vec<PathBuf> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    })
    .await
    .unwrap_or_default()
}

/// Remove `root` and its subdirectories if they are empty, deepest first.
/// Anything still holding files is left alone.
async fn remove_empty_dirs(root: &Path) {
    let root = root.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || {
        let dirs: Vec<PathBuf> = WalkDir::new(&root)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();
        for dir in dirs {
            if let Err(e) = std::fs::remove_dir(&dir) {
                debug!("Keeping {}: {}", dir.display(), e);
            }
        }
    })
    .await;
}
