//! Error types for the edgequake-hotfolder library.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! * [`HotfolderError`] — returned to the caller of an orchestrator or store
//!   operation (duplicate profile, unreadable configuration, a profile
//!   directory that cannot be created). These are the only errors a UI or CLI
//!   ever sees.
//!
//! * [`PageError`] — a single page of a document failed to render, encode or
//!   be written. Recorded in [`crate::convert::FileOutcome`] and logged; the
//!   remaining pages still run.
//!
//! * [`RelocateError`], [`RenderError`], [`EncodeError`] — caught at the
//!   smallest enclosing unit (merge step, page, file) inside a watcher and
//!   turned into a logged outcome. A watcher never dies because of them.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the store and orchestrator.
#[derive(Debug, Error)]
pub enum HotfolderError {
    // ── Profile errors ────────────────────────────────────────────────────
    /// A profile with this name already exists.
    #[error("Profile '{name}' already exists")]
    DuplicateProfile { name: String },

    /// No profile with this name is configured.
    #[error("Profile '{name}' does not exist")]
    UnknownProfile { name: String },

    /// The name cannot be used as a directory component.
    #[error("Invalid profile name '{name}': {reason}")]
    InvalidProfileName { name: String, reason: String },

    /// Profiles cannot be created before the network folder is chosen.
    #[error("Network folder is not set.\nRun: hotfolder set-network-folder <PATH>")]
    NetworkFolderUnset,

    /// A profile directory could not be created.
    #[error("Failed to create profile directory '{path}': {source}")]
    ProfileDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Persisted configuration ───────────────────────────────────────────
    #[error("Failed to read configuration '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration '{path}' is not valid JSON: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write configuration '{path}': {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Runtime ───────────────────────────────────────────────────────────
    /// The filesystem watch on a directory could not be established.
    #[error("Cannot watch '{path}': {detail}")]
    WatchFailed { path: PathBuf, detail: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The orchestrator's scheduler has already shut down.
    #[error("Orchestrator is shut down")]
    OrchestratorStopped,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The page's image simply does not appear; the other pages of the same
/// document proceed. Any page error keeps the source document on disk.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    #[error("Page {page}: encoding failed: {detail}")]
    EncodeFailed { page: usize, detail: String },

    #[error("Page {page}: could not place output: {detail}")]
    WriteFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::EncodeFailed { page, .. }
            | PageError::WriteFailed { page, .. } => *page,
        }
    }
}

/// Failures while moving or merging a tree into the output root.
#[derive(Debug, Error)]
pub enum RelocateError {
    /// The source vanished before it could be moved.
    #[error("Source '{path}' no longer exists")]
    NotFound { path: PathBuf },

    /// The filesystem kept denying the move (sharing lock, permission flap).
    #[error("Moving '{path}' still failing after {attempts} attempts: {source}")]
    TransientExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by a [`crate::pipeline::render::PageRenderer`].
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The document file is gone.
    #[error("Document '{path}' not found")]
    NotFound { path: PathBuf },

    /// The document could not be opened or parsed.
    #[error("Cannot open document '{path}': {detail}")]
    Open { path: PathBuf, detail: String },

    /// A single page could not be rasterised.
    #[error("Page {page} could not be rendered: {detail}")]
    Page { page: usize, detail: String },

    /// The rendering library is unavailable.
    #[error("Rendering backend unavailable: {0}")]
    Backend(String),
}

/// Errors reported by a [`crate::pipeline::encode::ImageEncoder`].
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Cannot write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Group-4 lines are limited to 65535 pixels.
    #[error("Page is {width} pixels wide, too wide for group-4")]
    TooWide { width: u32 },
}

/// Returns `true` for I/O failures that are worth retrying: the path exists
/// but another process holds it or permissions are briefly unavailable.
pub fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::WouldBlock
            | ErrorKind::ResourceBusy
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
    ) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}
