//! # edgequake-hotfolder
//!
//! Watch folders for arriving PDFs and images, wait until each arrival has
//! finished copying, convert it to page images and move the results into a
//! completed-output tree.
//!
//! ## Pipeline Overview
//!
//! ```text
//! filesystem event
//!  │
//!  ├─ 1. Watch     ProfileWatcher: creations and renames in the watch root
//!  ├─ 2. Settle    StabilityDetector: size unchanged for a quiet window
//!  ├─ 3. Relocate  Relocator: move or merge directories, conflicts/ on collision
//!  ├─ 4. Render    PageRenderer: pdfium rasterisation at 200 DPI (spawn_blocking)
//!  ├─ 5. Encode    ImageEncoder: RGB JPEG q60 or bi-level TIFF
//!  └─ 6. Commit    outputs renamed into place, source deleted only if every page succeeded
//! ```
//!
//! Above the pipeline, an [`Orchestrator`] owns the named profiles, each with
//! a `JPEG`, `TIFF` and `COMPLETE` folder, and admits one watcher per
//! (profile, output kind) under a global concurrency cap.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_hotfolder::{
//!     Orchestrator, PdfiumRenderer, ProfileStore, StandardEncoder, WatchConfig, WatcherLauncher,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WatchConfig::default();
//!     let store = ProfileStore::load_or_create("hotfolder.json")?;
//!     let launcher = WatcherLauncher::new(
//!         config.clone(),
//!         Arc::new(PdfiumRenderer::new()),
//!         Arc::new(StandardEncoder),
//!     );
//!     let orchestrator = Orchestrator::start(store, &config, Arc::new(launcher));
//!
//!     orchestrator.set_network_folder("/srv/scans").await?;
//!     orchestrator.add_profile("acme").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `hotfolder` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-hotfolder = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod relocate;
pub mod retry;
pub mod stability;
pub mod store;
pub mod watcher;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{OutputKind, SourceKind, WatchConfig, WatchConfigBuilder};
pub use convert::{ConversionTask, Converter, FileOutcome};
pub use error::{HotfolderError, PageError, RelocateError};
pub use orchestrator::{
    JobKey, Orchestrator, OrchestratorStatus, ShutdownMode, WatcherLauncher, WorkerLauncher,
    WorkerSpec,
};
pub use pipeline::encode::{ImageEncoder, StandardEncoder};
pub use pipeline::render::{PageRenderer, PdfiumRenderer};
pub use progress::{ConversionObserver, NoopObserver};
pub use relocate::{Relocation, Relocator};
pub use retry::RetryPolicy;
pub use stability::{Stability, StabilityDetector};
pub use store::{ProfileRecord, ProfileStatus, ProfileStore};
pub use watcher::{ProfileWatcher, WatcherState, WorkerControl};
