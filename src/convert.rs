//! File conversion: documents to page images, images to images.
//!
//! A [`ConversionTask`] is one discovered file. [`Converter::process`] runs it
//! to a terminal [`FileOutcome`]:
//!
//! * Every page of a document is rendered, colour converted and encoded as
//!   `{stem}_page_{NNN}.{ext}`, with the index zero-padded to the number of
//!   digits of the page count. Pages run concurrently; a failing page is
//!   retried on its own and then skipped while the others proceed.
//! * A single image becomes `{stem}.{ext}` in the destination directory.
//! * The source is deleted only after every output is in place. A source
//!   that is still on disk means "not fully processed" and is safe to hand
//!   in again: outputs are additive and never overwrite a foreign file.
//! * A file that vanishes is abandoned. Any other failure outside the page
//!   loop (unreadable document, undecodable image) retries the whole file
//!   under the file retry policy.
//!
//! Each output is encoded to a `.part` sibling and renamed into place on
//! the blocking pool, so once an encode starts the final file either appears
//! complete or not at all, even if the conversion is cancelled meanwhile.

use crate::config::{OutputKind, SourceKind, WatchConfig};
use crate::error::{PageError, RenderError};
use crate::pipeline::encode::{EncodeOptions, ImageEncoder};
use crate::pipeline::render::{self, PageRenderer};
use crate::progress::{NoopObserver, Observer};
use crate::relocate::conflict_target;
use crate::stability::{Stability, StabilityDetector};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One file waiting to be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionTask {
    pub source: PathBuf,
    /// Directory receiving the outputs.
    pub dest_dir: PathBuf,
    pub kind: SourceKind,
    /// Wait for the file to stop changing before each attempt.
    pub check_stability: bool,
}

/// Terminal state of a [`ConversionTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// All outputs written, source deleted.
    Converted { outputs: Vec<PathBuf> },
    /// Some pages failed; the written pages stay, so does the source.
    Partial {
        outputs: Vec<PathBuf>,
        errors: Vec<PageError>,
    },
    /// The source disappeared.
    Abandoned,
    /// Whole-file retries exhausted; the source stays.
    Failed { attempts: u32, reason: String },
}

impl FileOutcome {
    /// Whether the source artifact was consumed.
    pub fn source_removed(&self) -> bool {
        matches!(self, FileOutcome::Converted { .. })
    }
}

/// Why a whole-file attempt stopped early.
#[derive(Debug)]
enum AttemptError {
    NotFound,
    Failed(String),
}

impl From<RenderError> for AttemptError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::NotFound { .. } => AttemptError::NotFound,
            other => AttemptError::Failed(other.to_string()),
        }
    }
}

/// Pages produced by one attempt.
struct PageRun {
    outputs: BTreeMap<usize, PathBuf>,
    errors: Vec<PageError>,
}

/// Converts files for one output kind.
pub struct Converter {
    kind: OutputKind,
    config: WatchConfig,
    options: EncodeOptions,
    renderer: Arc<dyn PageRenderer>,
    encoder: Arc<dyn ImageEncoder>,
    detector: StabilityDetector,
    observer: Observer,
}

impl Converter {
    pub fn new(
        kind: OutputKind,
        config: WatchConfig,
        renderer: Arc<dyn PageRenderer>,
        encoder: Arc<dyn ImageEncoder>,
    ) -> Self {
        let options = EncodeOptions::for_kind(kind, &config);
        let detector = StabilityDetector::new(config.poll_interval, config.file_stable_for);
        Self {
            kind,
            config,
            options,
            renderer,
            encoder,
            detector,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Build a task for `source` if this kind handles it.
    pub fn task_for(
        &self,
        source: &Path,
        dest_dir: &Path,
        check_stability: bool,
    ) -> Option<ConversionTask> {
        let kind = self.kind.classify(source)?;
        Some(ConversionTask {
            source: source.to_path_buf(),
            dest_dir: dest_dir.to_path_buf(),
            kind,
            check_stability,
        })
    }

    /// Run a task to its terminal outcome.
    pub async fn process(&self, task: &ConversionTask) -> FileOutcome {
        let source = task.source.as_path();
        let policy = self.config.file_retry;
        let max = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            if attempt > 1 {
                let delay = policy.delay_before(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    source.display(),
                    attempt,
                    max,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
            self.observer.on_file_start(source, attempt);

            if task.check_stability {
                if self.detector.wait_until_stable(source).await == Stability::NotFound {
                    info!("{} disappeared, abandoning", source.display());
                    return FileOutcome::Abandoned;
                }
            } else if !tokio::fs::try_exists(source).await.unwrap_or(false) {
                info!("{} disappeared, abandoning", source.display());
                return FileOutcome::Abandoned;
            }

            let run = match task.kind {
                SourceKind::Pdf => self.convert_document(task).await,
                SourceKind::Image => self.convert_image(task).await,
            };

            match run {
                Ok(run) => {
                    let outputs: Vec<PathBuf> = run.outputs.into_values().collect();
                    if !run.errors.is_empty() {
                        warn!(
                            "{}: {} page(s) failed, keeping source",
                            source.display(),
                            run.errors.len()
                        );
                        self.observer
                            .on_file_failed(source, &format!("{} page(s) failed", run.errors.len()));
                        return FileOutcome::Partial {
                            outputs,
                            errors: run.errors,
                        };
                    }
                    return match self.remove_source(source).await {
                        Ok(()) => {
                            info!(
                                "Converted {} → {} file(s)",
                                source.display(),
                                outputs.len()
                            );
                            self.observer.on_file_complete(source, outputs.len());
                            FileOutcome::Converted { outputs }
                        }
                        Err(reason) => {
                            warn!("{}", reason);
                            self.observer.on_file_failed(source, &reason);
                            FileOutcome::Failed {
                                attempts: attempt,
                                reason,
                            }
                        }
                    };
                }
                Err(AttemptError::NotFound) => {
                    info!("{} disappeared, abandoning", source.display());
                    return FileOutcome::Abandoned;
                }
                Err(AttemptError::Failed(reason)) => {
                    warn!(
                        "{}: attempt {}/{} failed: {}",
                        source.display(),
                        attempt,
                        max,
                        reason
                    );
                    last_error = reason;
                }
            }
        }

        warn!(
            "Giving up on {} after {} attempts: {}",
            source.display(),
            max,
            last_error
        );
        self.observer.on_file_failed(source, &last_error);
        FileOutcome::Failed {
            attempts: max,
            reason: last_error,
        }
    }

    async fn convert_document(&self, task: &ConversionTask) -> Result<PageRun, AttemptError> {
        let source = task.source.as_path();
        let total = render::page_count(&self.renderer, source).await?;
        if total == 0 {
            return Err(AttemptError::Failed("document has no pages".into()));
        }
        let stem_owned = file_stem(source);
        let stem = stem_owned.as_str();
        info!("{}: {} pages", source.display(), total);

        let results: Vec<(usize, Result<PathBuf, PageError>)> = stream::iter(
            (0..total).map(|idx| async move { (idx, self.convert_page(task, stem, idx, total).await) }),
        )
        .buffer_unordered(self.config.page_concurrency)
        .collect()
        .await;

        let mut run = PageRun {
            outputs: BTreeMap::new(),
            errors: Vec::new(),
        };
        for (idx, result) in results {
            match result {
                Ok(path) => {
                    run.outputs.insert(idx, path);
                }
                Err(e) => run.errors.push(e),
            }
        }
        run.errors.sort_by_key(PageError::page);

        if !run.errors.is_empty() && !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(AttemptError::NotFound);
        }
        Ok(run)
    }

    /// Render, encode and place one page, with page-level retries.
    async fn convert_page(
        &self,
        task: &ConversionTask,
        stem: &str,
        idx: usize,
        total: usize,
    ) -> Result<PathBuf, PageError> {
        let page = idx + 1;
        let source = task.source.as_path();
        let target = task
            .dest_dir
            .join(page_file_name(stem, page, total, self.kind.extension()));
        let target = target.as_path();
        let what = format!("{} page {}", source.display(), page);

        let result = self
            .config
            .page_retry
            .run(
                &what,
                |_| async move {
                    let image = render::render_page(&self.renderer, source, idx, self.config.dpi)
                        .await
                        .map_err(|e| PageError::RenderFailed {
                            page,
                            detail: e.to_string(),
                        })?;
                    self.write_output(image, target, page).await
                },
                |_| true,
            )
            .await
            .map_err(|x| x.error);

        match &result {
            Ok(out) => {
                debug!("Saved {}", out.display());
                self.observer.on_page_complete(source, page, total, out);
            }
            Err(e) => {
                warn!("{}", e);
                self.observer
                    .on_page_error(source, page, total, &e.to_string());
            }
        }
        result
    }

    async fn convert_image(&self, task: &ConversionTask) -> Result<PageRun, AttemptError> {
        let image = render::load_image(&task.source).await?;
        let name = format!("{}.{}", file_stem(&task.source), self.kind.extension());
        let out = self
            .write_output(image, &task.dest_dir.join(name), 1)
            .await
            .map_err(|e| AttemptError::Failed(e.to_string()))?;
        Ok(PageRun {
            outputs: BTreeMap::from([(0, out)]),
            errors: Vec::new(),
        })
    }

    /// Encode `image` to `target` (or its conflicts slot when taken).
    async fn write_output(
        &self,
        image: DynamicImage,
        target: &Path,
        page: usize,
    ) -> Result<PathBuf, PageError> {
        let write_failed = |detail: String| PageError::WriteFailed { page, detail };

        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| write_failed(e.to_string()))?;
        }
        let target = if tokio::fs::try_exists(target).await.unwrap_or(false) {
            conflict_target(target)
                .await
                .map_err(|e| write_failed(e.to_string()))?
        } else {
            target.to_path_buf()
        };

        let encoder = Arc::clone(&self.encoder);
        let options = self.options;
        tokio::task::spawn_blocking(move || {
            let part = part_path(&target);
            if let Err(e) = encoder.encode(&image, &options, &part) {
                let _ = std::fs::remove_file(&part);
                return Err(PageError::EncodeFailed {
                    page,
                    detail: e.to_string(),
                });
            }
            if let Err(e) = std::fs::rename(&part, &target) {
                let _ = std::fs::remove_file(&part);
                return Err(PageError::WriteFailed {
                    page,
                    detail: e.to_string(),
                });
            }
            Ok(target)
        })
        .await
        .map_err(|e| write_failed(format!("encode task panicked: {e}")))?
    }

    async fn remove_source(&self, source: &Path) -> Result<(), String> {
        let what = format!("remove {}", source.display());
        match self
            .config
            .move_retry
            .run(
                &what,
                |_| tokio::fs::remove_file(source),
                |e: &std::io::Error| crate::error::is_transient(e),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(x) if x.error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(x) => Err(format!(
                "outputs written but {} could not be removed: {}",
                source.display(),
                x.error
            )),
        }
    }
}

/// `{stem}_page_{NNN}.{ext}` with `NNN` padded to the digits of `total`.
pub fn page_file_name(stem: &str, page: usize, total: usize, ext: &str) -> String {
    let width = total.to_string().len();
    format!("{stem}_page_{page:0width$}.{ext}")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_are_padded_to_page_count_digits() {
        assert_eq!(page_file_name("doc", 1, 5, "jpg"), "doc_page_1.jpg");
        assert_eq!(page_file_name("doc", 7, 12, "tif"), "doc_page_07.tif");
        assert_eq!(page_file_name("doc", 3, 100, "jpg"), "doc_page_003.jpg");
        assert_eq!(page_file_name("doc", 100, 100, "jpg"), "doc_page_100.jpg");
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/out/a_page_1.jpg")),
            PathBuf::from("/out/a_page_1.jpg.part")
        );
    }

    #[test]
    fn only_conversion_removes_the_source() {
        assert!(FileOutcome::Converted { outputs: vec![] }.source_removed());
        assert!(!FileOutcome::Abandoned.source_removed());
        assert!(!FileOutcome::Partial {
            outputs: vec![],
            errors: vec![]
        }
        .source_removed());
        assert!(!FileOutcome::Failed {
            attempts: 3,
            reason: "x".into()
        }
        .source_removed());
    }

    #[test]
    fn render_not_found_abandons_the_attempt() {
        let e: AttemptError = RenderError::NotFound {
            path: PathBuf::from("/gone.pdf"),
        }
        .into();
        assert!(matches!(e, AttemptError::NotFound));
        let e: AttemptError = RenderError::Backend("no pdfium".into()).into();
        assert!(matches!(e, AttemptError::Failed(_)));
    }
}
