//! Observer trait for per-file and per-page conversion events.
//!
//! Inject an [`Arc<dyn ConversionObserver>`] through
//! [`crate::convert::Converter::with_observer`] to receive events as files are
//! converted, for example to feed a status display or count outcomes in
//! tests. Logging happens regardless; the observer is an extra channel.
//!
//! # Example
//!
//! ```rust
//! use edgequake_hotfolder::ConversionObserver;
//! use std::path::Path;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     pages: AtomicUsize,
//! }
//!
//! impl ConversionObserver for CountingObserver {
//!     fn on_page_complete(&self, _source: &Path, _page: usize, _total: usize, _output: &Path) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

/// Called by the converter as it processes files.
///
/// Pages of one document are converted concurrently, so page callbacks may
/// arrive from several threads and out of order. All methods default to
/// no-ops.
pub trait ConversionObserver: Send + Sync {
    /// A conversion attempt for `source` begins.
    fn on_file_start(&self, source: &Path, attempt: u32) {
        let _ = (source, attempt);
    }

    /// Page `page` (1-indexed) of `total` was written to `output`.
    fn on_page_complete(&self, source: &Path, page: usize, total: usize, output: &Path) {
        let _ = (source, page, total, output);
    }

    /// Page `page` of `total` failed after its retries.
    fn on_page_error(&self, source: &Path, page: usize, total: usize, error: &str) {
        let _ = (source, page, total, error);
    }

    /// Every output was written and the source deleted.
    fn on_file_complete(&self, source: &Path, outputs: usize) {
        let _ = (source, outputs);
    }

    /// All attempts were used up; the source stays where it is.
    fn on_file_failed(&self, source: &Path, reason: &str) {
        let _ = (source, reason);
    }
}

/// The default observer.
pub struct NoopObserver;

impl ConversionObserver for NoopObserver {}

/// Convenience alias for the shared form.
pub type Observer = Arc<dyn ConversionObserver>;
