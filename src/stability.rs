//! Write-completion detection by polling.
//!
//! Filesystem events say that a path appeared, not that whoever is writing it
//! has finished. The detector samples the path's size (a file) or the size of
//! every file below it (a directory) once per poll interval, and reports
//! [`Stability::Stable`] once the sample has not changed for the configured
//! quiet window. Any change restarts the window.
//!
//! There is deliberately no upper bound on the wait: a stalled upload keeps
//! the caller waiting until it either completes or disappears.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Result of a stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Unchanged for at least the quiet window.
    Stable,
    /// The path vanished while being checked.
    NotFound,
}

/// One observation of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    File(u64),
    /// Relative path of every file below the directory → size.
    Dir(BTreeMap<PathBuf, u64>),
}

/// Polls a path until it stops changing.
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    poll_interval: Duration,
    stable_for: Duration,
}

impl StabilityDetector {
    pub fn new(poll_interval: Duration, stable_for: Duration) -> Self {
        Self {
            poll_interval,
            stable_for,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn stable_for(&self) -> Duration {
        self.stable_for
    }

    /// Wait until `path` has been unchanged for the quiet window.
    ///
    /// Returns as soon as the path disappears, whether the size lookup or
    /// the directory listing noticed it.
    pub async fn wait_until_stable(&self, path: &Path) -> Stability {
        let Some(mut previous) = snapshot(path).await else {
            debug!("{} vanished before the first sample", path.display());
            return Stability::NotFound;
        };
        let mut stable_since = Instant::now();

        loop {
            sleep(self.poll_interval).await;

            let Some(current) = snapshot(path).await else {
                debug!("{} vanished during the stability check", path.display());
                return Stability::NotFound;
            };

            if current != previous {
                trace!("{} still changing", path.display());
                previous = current;
                stable_since = Instant::now();
                continue;
            }

            if stable_since.elapsed() >= self.stable_for {
                debug!(
                    "{} stable for {}ms",
                    path.display(),
                    stable_since.elapsed().as_millis()
                );
                return Stability::Stable;
            }
        }
    }
}

/// Sample `path`. `None` means it no longer exists.
pub async fn snapshot(path: &Path) -> Option<Snapshot> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || snapshot_blocking(&owned))
        .await
        .ok()
        .flatten()
}

fn snapshot_blocking(path: &Path) -> Option<Snapshot> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        // Unreadable but present: an empty sample keeps the caller polling.
        Err(_) => return Some(Snapshot::File(0)),
    };

    if !meta.is_dir() {
        return Some(Snapshot::File(meta.len()));
    }

    let mut sizes = BTreeMap::new();
    for entry in WalkDir::new(path).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // The root itself going away is a disappearance; a child
                // vanishing mid-walk is just another change.
                if e.depth() == 0 || !path.exists() {
                    return None;
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if let Ok(rel) = entry.path().strip_prefix(path) {
            sizes.insert(rel.to_path_buf(), size);
        }
    }
    Some(Snapshot::Dir(sizes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn snapshot_of_file_is_its_size() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.pdf");
        std::fs::write(&f, b"12345").unwrap();
        assert_eq!(snapshot(&f).await, Some(Snapshot::File(5)));
    }

    #[tokio::test]
    async fn snapshot_of_directory_lists_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top.pdf"), b"ab").unwrap();
        std::fs::write(dir.path().join("sub/inner.jpg"), b"abc").unwrap();

        let Some(Snapshot::Dir(map)) = snapshot(dir.path()).await else {
            panic!("expected a directory snapshot");
        };
        assert_eq!(map.get(Path::new("top.pdf")), Some(&2));
        assert_eq!(map.get(Path::new("sub/inner.jpg")), Some(&3));
    }

    #[tokio::test]
    async fn missing_path_has_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(snapshot(&dir.path().join("nope")).await, None);
    }

    #[tokio::test]
    async fn missing_path_is_not_found_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let detector = StabilityDetector::new(Duration::from_secs(60), Duration::from_secs(60));
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            detector.wait_until_stable(&dir.path().join("ghost.pdf")),
        )
        .await
        .expect("must not wait for a missing path");
        assert_eq!(outcome, Stability::NotFound);
    }

    #[tokio::test]
    async fn growing_directory_resets_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("batch");
        std::fs::create_dir(&root).unwrap();
        let detector =
            StabilityDetector::new(Duration::from_millis(20), Duration::from_millis(150));

        let writer_root = root.clone();
        let writer = tokio::spawn(async move {
            for i in 0..6 {
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(writer_root.join(format!("f{}.pdf", i % 2)))
                    .unwrap();
                f.write_all(b"more").unwrap();
                sleep(Duration::from_millis(40)).await;
            }
        });

        let started = Instant::now();
        assert_eq!(detector.wait_until_stable(&root).await, Stability::Stable);
        writer.await.unwrap();
        // six writes 40 ms apart keep resetting the 150 ms window
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
