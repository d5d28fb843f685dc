//! One long-lived watch loop per (profile, output kind).
//!
//! ```text
//! Idle ──start──▶ Watching ──arrival──▶ Handling ──all done──▶ Watching
//!                    │                      │
//!                    └──────terminate───────┴──────▶ Stopped
//! ```
//!
//! A [`ProfileWatcher`] listens for creation and rename-in events directly
//! inside its watch root and hands every qualifying entry to its own task:
//!
//! * a directory waits until its whole tree is quiet, is relocated into the
//!   output root and its relocated files are converted in place;
//! * a supported file is converted into the output root once stable.
//!
//! Arrivals are independent of each other and run concurrently. Entries
//! already present when the watcher starts are picked up by an initial sweep,
//! and a path already being handled is never dispatched twice.
//!
//! Stopping is driven by a [`WorkerControl`]: `terminate` aborts in-flight
//! work at once (outputs are renamed into place atomically, sources are only
//! deleted after all outputs exist, so nothing is corrupted), `drain` stops
//! intake and waits for in-flight work to finish.

use crate::convert::{ConversionTask, Converter, FileOutcome};
use crate::error::{HotfolderError, RelocateError};
use crate::relocate::Relocator;
use crate::stability::{Stability, StabilityDetector};
use futures::stream::{self, StreamExt};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Handling,
    Stopped,
}

/// Stop signals for a running worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop now, abandoning in-flight conversions.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Stop accepting arrivals and return once in-flight work is done.
    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Resolves once either stop signal has been raised.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.drain.cancelled() => {}
        }
    }
}

/// Work shared by every arrival task of one watcher.
struct Handler {
    watch_dir: PathBuf,
    output_dir: PathBuf,
    converter: Arc<Converter>,
    relocator: Arc<Relocator>,
    dir_detector: StabilityDetector,
    file_concurrency: usize,
}

/// Watches one directory and converts what lands in it.
pub struct ProfileWatcher {
    watch_dir: PathBuf,
    handler: Arc<Handler>,
    scan_existing: bool,
    state: watch::Sender<WatcherState>,
}

impl ProfileWatcher {
    /// A watcher feeding arrivals in `watch_dir` through `converter`, with
    /// results under `output_dir`. Tuning comes from the converter's config.
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        converter: Arc<Converter>,
        relocator: Arc<Relocator>,
    ) -> Self {
        let config = converter.config();
        let dir_detector = StabilityDetector::new(config.poll_interval, config.dir_stable_for);
        let file_concurrency = config.file_concurrency;
        let scan_existing = config.scan_existing_on_start;
        let (state, _) = watch::channel(WatcherState::Idle);
        let watch_dir: PathBuf = watch_dir.into();
        Self {
            handler: Arc::new(Handler {
                watch_dir: watch_dir.clone(),
                output_dir: output_dir.into(),
                converter,
                relocator,
                dir_detector,
                file_concurrency,
            }),
            watch_dir,
            scan_existing,
            state,
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.handler.output_dir
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Watch until `control` says stop.
    ///
    /// Fails only if the watch cannot be set up. Conversion problems are
    /// logged per file and never end the loop.
    pub async fn run(self, control: WorkerControl) -> Result<(), HotfolderError> {
        let result = self.watch_loop(&control).await;
        self.state.send_replace(WatcherState::Stopped);
        result
    }

    async fn watch_loop(&self, control: &WorkerControl) -> Result<(), HotfolderError> {
        let watch_failed = |detail: String| HotfolderError::WatchFailed {
            path: self.watch_dir.clone(),
            detail,
        };

        if !tokio::fs::metadata(&self.watch_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(watch_failed("not a directory".into()));
        }
        tokio::fs::create_dir_all(&self.handler.output_dir)
            .await
            .map_err(|e| HotfolderError::ProfileDirectory {
                path: self.handler.output_dir.clone(),
                source: e,
            })?;

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut fs_watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| watch_failed(e.to_string()))?;
        fs_watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_failed(e.to_string()))?;

        info!(
            "Watching {} → {}",
            self.watch_dir.display(),
            self.handler.output_dir.display()
        );
        self.state.send_replace(WatcherState::Watching);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut in_flight: HashMap<Id, PathBuf> = HashMap::new();

        if self.scan_existing {
            for path in existing_entries(&self.watch_dir).await {
                self.dispatch(path, &mut tasks, &mut in_flight).await;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    if !tasks.is_empty() {
                        info!("Terminating with {} arrival(s) in flight", tasks.len());
                    }
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
                _ = control.drain.cancelled() => {
                    drop(fs_watcher);
                    info!("Draining {} arrival(s)", tasks.len());
                    drain(&control.cancel, &mut tasks, &mut in_flight).await;
                    break;
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    reap(joined, &mut in_flight);
                }
                received = events.recv() => match received {
                    Some(Ok(event)) => {
                        for path in arrivals(&event, &self.watch_dir) {
                            self.dispatch(path, &mut tasks, &mut in_flight).await;
                        }
                    }
                    Some(Err(e)) => warn!("Watch error on {}: {}", self.watch_dir.display(), e),
                    None => return Err(watch_failed("event channel closed".into())),
                },
            }
            let state = if tasks.is_empty() {
                WatcherState::Watching
            } else {
                WatcherState::Handling
            };
            self.state.send_if_modified(|s| std::mem::replace(s, state) != state);
        }

        info!("Stopped watching {}", self.watch_dir.display());
        Ok(())
    }

    async fn dispatch(
        &self,
        path: PathBuf,
        tasks: &mut JoinSet<()>,
        in_flight: &mut HashMap<Id, PathBuf>,
    ) {
        if in_flight.values().any(|p| p == &path) {
            debug!("{} already in flight", path.display());
            return;
        }
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => {
                debug!("{} vanished before dispatch", path.display());
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        let handle = if meta.is_dir() {
            let dir = path.clone();
            tasks.spawn(
                async move {
                    handler.handle_dir(&dir).await;
                }
                .in_current_span(),
            )
        } else {
            let Some(task) = handler
                .converter
                .task_for(&path, &handler.output_dir, true)
            else {
                debug!("Ignoring unsupported {}", path.display());
                return;
            };
            tasks.spawn(async move { handler.handle_file(task).await }.in_current_span())
        };
        debug!("Dispatched {}", path.display());
        in_flight.insert(handle.id(), path);
        self.state.send_replace(WatcherState::Handling);
    }
}

impl Handler {
    /// Relocate and convert a settled directory. Returns the relocated
    /// sources that were kept because their conversion did not complete.
    async fn handle_dir(&self, dir: &Path) -> Vec<PathBuf> {
        if self.dir_detector.wait_until_stable(dir).await == Stability::NotFound {
            info!("{} disappeared before settling", dir.display());
            return Vec::new();
        }
        let Some(name) = dir.file_name() else {
            return Vec::new();
        };
        let destination = self.output_dir.join(name);

        let relocation = match self.relocator.relocate(dir, &destination).await {
            Ok(r) => r,
            Err(RelocateError::NotFound { .. }) => {
                info!("{} disappeared before relocation", dir.display());
                return Vec::new();
            }
            Err(e) => {
                error!("{}", e);
                return Vec::new();
            }
        };

        let converter = &self.converter;
        let tasks: Vec<ConversionTask> = relocation
            .files
            .iter()
            .filter_map(|file| {
                let parent = file.parent().unwrap_or(&destination);
                converter.task_for(file, parent, false)
            })
            .collect();
        debug!(
            "{}: {} of {} relocated file(s) to convert",
            destination.display(),
            tasks.len(),
            relocation.files.len()
        );

        let stranded: Vec<PathBuf> = stream::iter(tasks)
            .map(|task| async move {
                let outcome = converter.process(&task).await;
                report(&task, &outcome);
                matches!(
                    outcome,
                    FileOutcome::Partial { .. } | FileOutcome::Failed { .. }
                )
                .then_some(task.source)
            })
            .buffer_unordered(self.file_concurrency)
            .filter_map(|kept| async move { kept })
            .collect()
            .await;

        // Nothing watches the output root, so these are not picked up again.
        for source in &stranded {
            error!(
                "{} was kept after a failed conversion; move it into {} to retry",
                source.display(),
                self.watch_dir.display()
            );
        }
        stranded
    }

    async fn handle_file(&self, task: ConversionTask) {
        let outcome = self.converter.process(&task).await;
        report(&task, &outcome);
    }
}

fn report(task: &ConversionTask, outcome: &FileOutcome) {
    let source = task.source.display();
    match outcome {
        FileOutcome::Converted { outputs } => {
            info!("Converted {} ({} output(s))", source, outputs.len())
        }
        FileOutcome::Partial { outputs, errors } => warn!(
            "Partially converted {}: {} page(s) written, {} failed",
            source,
            outputs.len(),
            errors.len()
        ),
        FileOutcome::Abandoned => info!("Abandoned {}", source),
        FileOutcome::Failed { attempts, reason } => {
            error!("Giving up on {} after {} attempt(s): {}", source, attempts, reason)
        }
    }
}

fn reap(joined: Result<(Id, ()), tokio::task::JoinError>, in_flight: &mut HashMap<Id, PathBuf>) {
    let id = match joined {
        Ok((id, ())) => id,
        Err(e) => {
            if e.is_panic() {
                error!("Arrival task panicked: {}", e);
            }
            e.id()
        }
    };
    if let Some(path) = in_flight.remove(&id) {
        debug!("Finished {}", path.display());
    }
}

async fn drain(
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
    in_flight: &mut HashMap<Id, PathBuf>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return;
            }
            joined = tasks.join_next_with_id() => match joined {
                Some(joined) => reap(joined, in_flight),
                None => return,
            },
        }
    }
}

/// Entries an event brings into `root`: creations and renames-in of direct
/// children. Hidden names and `.part` files are skipped.
fn arrivals(event: &Event, root: &Path) -> Vec<PathBuf> {
    let candidates: &[PathBuf] = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            &event.paths
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.last() {
            Some(to) => std::slice::from_ref(to),
            None => &[],
        },
        _ => &[],
    };
    candidates
        .iter()
        .filter(|p| p.parent() == Some(root) && qualifies(p))
        .cloned()
        .collect()
}

fn qualifies(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => !name.starts_with('.') && !name.ends_with(".part"),
        None => false,
    }
}

async fn existing_entries(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot scan {}: {}", root.display(), e);
            return found;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if qualifies(&path) {
            found.push(path);
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputKind, WatchConfig};
    use crate::error::RenderError;
    use crate::pipeline::encode::StandardEncoder;
    use crate::pipeline::render::PageRenderer;
    use crate::retry::RetryPolicy;
    use image::{DynamicImage, Rgb, RgbImage};
    use crate::convert::page_file_name;
    use notify::event::CreateKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    struct NoDocuments;

    impl PageRenderer for NoDocuments {
        fn page_count(&self, _: &Path) -> Result<usize, RenderError> {
            Err(RenderError::Backend("no renderer in this test".into()))
        }

        fn render_page(&self, _: &Path, _: usize, _: u32) -> Result<DynamicImage, RenderError> {
            Err(RenderError::Backend("no renderer in this test".into()))
        }
    }

    fn fast_config() -> WatchConfig {
        WatchConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .file_stable_for(Duration::from_millis(40))
            .dir_stable_for(Duration::from_millis(80))
            .file_retry(RetryPolicy::once())
            .build()
            .unwrap()
    }

    fn watcher(watch: &Path, out: &Path) -> ProfileWatcher {
        let config = fast_config();
        let relocator = Arc::new(Relocator::new(config.move_retry));
        let converter = Arc::new(Converter::new(
            OutputKind::Jpeg,
            config,
            Arc::new(NoDocuments),
            Arc::new(StandardEncoder),
        ));
        ProfileWatcher::new(watch, out, converter, relocator)
    }

    /// Documents hold their page count as text. Rendering page `hold_at`
    /// blocks until released.
    #[derive(Default)]
    struct GatedRenderer {
        hold_at: usize,
        reached: AtomicBool,
        released: AtomicBool,
    }

    impl PageRenderer for GatedRenderer {
        fn page_count(&self, path: &Path) -> Result<usize, RenderError> {
            let body = std::fs::read_to_string(path).map_err(|_| RenderError::NotFound {
                path: path.to_path_buf(),
            })?;
            body.trim()
                .parse()
                .map_err(|_| RenderError::Backend("not a page count".into()))
        }

        fn render_page(&self, _: &Path, index: usize, _: u32) -> Result<DynamicImage, RenderError> {
            if index + 1 == self.hold_at {
                self.reached.store(true, Ordering::SeqCst);
                let started = std::time::Instant::now();
                while !self.released.load(Ordering::SeqCst)
                    && started.elapsed() < Duration::from_secs(10)
                {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                12,
                16,
                Rgb([40, 80, 160]),
            )))
        }
    }

    fn write_png(path: &Path) {
        RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])).save(path).unwrap();
    }

    async fn wait_for(path: &Path) {
        timeout(Duration::from_secs(10), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never appeared", path.display()));
    }

    #[test]
    fn arrivals_keep_direct_children_only() {
        let root = Path::new("/w");
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/w/a.pdf"))
            .add_path(PathBuf::from("/w/sub/b.pdf"))
            .add_path(PathBuf::from("/w/.hidden"))
            .add_path(PathBuf::from("/w/a.jpg.part"));
        assert_eq!(arrivals(&event, root), vec![PathBuf::from("/w/a.pdf")]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/elsewhere/x.pdf"))
            .add_path(PathBuf::from("/w/x.pdf"));
        assert_eq!(arrivals(&renamed, root), vec![PathBuf::from("/w/x.pdf")]);

        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/w/a.pdf"));
        assert!(arrivals(&removed, root).is_empty());
    }

    #[tokio::test]
    async fn missing_watch_root_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher(&dir.path().join("absent"), &dir.path().join("out"));
        let mut state = w.subscribe();
        let err = w.run(WorkerControl::new()).await.unwrap_err();
        assert!(matches!(err, HotfolderError::WatchFailed { .. }));
        assert_eq!(*state.borrow_and_update(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn converts_existing_and_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let watch_dir = dir.path().join("JPEG");
        let out = dir.path().join("COMPLETE");
        std::fs::create_dir_all(&watch_dir).unwrap();
        write_png(&watch_dir.join("early.png"));

        let w = watcher(&watch_dir, &out);
        let mut state = w.subscribe();
        let control = WorkerControl::new();
        let run = tokio::spawn(w.run(control.clone()));

        state
            .wait_for(|s| *s != WatcherState::Idle)
            .await
            .unwrap();
        write_png(&watch_dir.join("late.png"));
        std::fs::write(watch_dir.join("notes.txt"), b"ignored").unwrap();

        wait_for(&out.join("early.jpg")).await;
        wait_for(&out.join("late.jpg")).await;
        timeout(Duration::from_secs(5), async {
            while watch_dir.join("late.png").exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(!watch_dir.join("early.png").exists());
        assert!(watch_dir.join("notes.txt").exists());

        control.terminate();
        run.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn relocates_directory_then_converts_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let watch_dir = dir.path().join("JPEG");
        let out = dir.path().join("COMPLETE");
        std::fs::create_dir_all(&watch_dir).unwrap();

        let w = watcher(&watch_dir, &out);
        let mut state = w.subscribe();
        let control = WorkerControl::new();
        let run = tokio::spawn(w.run(control.clone()));
        state
            .wait_for(|s| *s != WatcherState::Idle)
            .await
            .unwrap();

        let batch = watch_dir.join("batch");
        std::fs::create_dir_all(batch.join("inner")).unwrap();
        write_png(&batch.join("one.png"));
        write_png(&batch.join("inner").join("two.png"));

        wait_for(&out.join("batch").join("one.jpg")).await;
        wait_for(&out.join("batch").join("inner").join("two.jpg")).await;
        assert!(!batch.exists());

        control.drain();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn terminate_stops_an_idle_watcher_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let watch_dir = dir.path().join("TIFF");
        std::fs::create_dir_all(&watch_dir).unwrap();
        let w = watcher(&watch_dir, &dir.path().join("out"));
        assert_eq!(w.watch_dir(), watch_dir.as_path());
        assert_eq!(w.output_dir(), dir.path().join("out").as_path());
        let control = WorkerControl::new();
        let run = tokio::spawn(w.run(control.clone()));
        control.terminate();
        assert!(control.is_terminated());
        timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_mid_document_keeps_source_and_finished_pages() {
        let dir = tempfile::tempdir().unwrap();
        let watch_dir = dir.path().join("JPEG");
        let out = dir.path().join("COMPLETE");
        std::fs::create_dir_all(&watch_dir).unwrap();

        let renderer = Arc::new(GatedRenderer {
            hold_at: 3,
            ..Default::default()
        });
        let mut config = fast_config();
        config.page_concurrency = 1;
        let relocator = Arc::new(Relocator::new(config.move_retry));
        let converter = Arc::new(Converter::new(
            OutputKind::Jpeg,
            config,
            renderer.clone(),
            Arc::new(StandardEncoder),
        ));
        let w = ProfileWatcher::new(&watch_dir, &out, converter, relocator);
        let mut state = w.subscribe();
        let control = WorkerControl::new();
        let run = tokio::spawn(w.run(control.clone()));
        state
            .wait_for(|s| *s != WatcherState::Idle)
            .await
            .unwrap();

        let source = watch_dir.join("ledger.pdf");
        std::fs::write(&source, b"5").unwrap();
        timeout(Duration::from_secs(10), async {
            while !renderer.reached.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("page 3 never started");

        control.terminate();
        timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(source.is_file());
        let page = |n| out.join(page_file_name("ledger", n, 5, "jpg"));
        for n in 1..=2 {
            let decoded = image::open(page(n)).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (12, 16));
        }
        for n in 3..=5 {
            assert!(!page(n).exists(), "page {n} should not exist");
        }
        let leftovers: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");

        renderer.released.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn failed_relocated_files_are_reported_as_stranded() {
        let dir = tempfile::tempdir().unwrap();
        let watch_dir = dir.path().join("JPEG");
        let out = dir.path().join("COMPLETE");
        let batch = watch_dir.join("batch");
        std::fs::create_dir_all(&batch).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(batch.join("broken.pdf"), b"%PDF-").unwrap();
        write_png(&batch.join("fine.png"));

        let w = watcher(&watch_dir, &out);
        let stranded = w.handler.handle_dir(&batch).await;

        let kept = out.join("batch").join("broken.pdf");
        assert_eq!(stranded, vec![kept.clone()]);
        assert!(kept.is_file());
        assert!(out.join("batch").join("fine.jpg").is_file());
        assert!(!out.join("batch").join("fine.png").exists());
        assert!(!batch.exists());
    }
}
