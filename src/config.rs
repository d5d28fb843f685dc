//! Runtime configuration for watchers, the conversion pipeline and the
//! orchestrator.
//!
//! Every timing and quality knob lives in [`WatchConfig`], built through
//! [`WatchConfigBuilder`]. The persisted profile list is a separate concern,
//! see [`crate::store`].

use crate::error::HotfolderError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Tuning shared by every worker of a process.
///
/// # Example
/// ```rust
/// use edgequake_hotfolder::WatchConfig;
/// use std::time::Duration;
///
/// let config = WatchConfig::builder()
///     .poll_interval(Duration::from_millis(500))
///     .dir_stable_for(Duration::from_secs(10))
///     .jpeg_quality(75)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Time between two size samples of the stability check. Default: 1 s.
    pub poll_interval: Duration,

    /// How long a single file must stay the same size. Default: 5 s.
    pub file_stable_for: Duration,

    /// How long a directory tree must stay unchanged. Default: 30 s.
    ///
    /// Directories are usually copied file by file, with pauses between
    /// files, so they need a longer quiet window than a single upload.
    pub dir_stable_for: Duration,

    /// Rasterisation resolution. Default: 200.
    pub dpi: u32,

    /// Lossy quality for JPEG output (1–100). Default: 60.
    pub jpeg_quality: u8,

    /// Luma cut-off for bi-level output: below is black. Default: 128.
    pub bilevel_threshold: u8,

    /// Pages of one document converted at the same time. Default: 4.
    pub page_concurrency: usize,

    /// Files of one relocated directory converted at the same time. Default: 4.
    pub file_concurrency: usize,

    /// Retry policy for moves the filesystem transiently refuses.
    /// Default: 5 attempts, 500 ms doubling.
    pub move_retry: RetryPolicy,

    /// Retry policy for a single page. Default: 2 attempts, 250 ms.
    pub page_retry: RetryPolicy,

    /// Retry policy for a whole file. Default: 3 attempts, 2 s.
    pub file_retry: RetryPolicy,

    /// Period of the orchestrator's admission cycle. Default: 1 s.
    pub admission_interval: Duration,

    /// Let in-flight conversions finish on shutdown instead of aborting them.
    /// Default: false.
    pub drain_on_shutdown: bool,

    /// Dispatch entries already present in the watch root when a watcher
    /// starts. Default: true.
    pub scan_existing_on_start: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            file_stable_for: Duration::from_secs(5),
            dir_stable_for: Duration::from_secs(30),
            dpi: 200,
            jpeg_quality: 60,
            bilevel_threshold: 128,
            page_concurrency: 4,
            file_concurrency: 4,
            move_retry: RetryPolicy::new(5, Duration::from_millis(500)),
            page_retry: RetryPolicy::new(2, Duration::from_millis(250)).fixed(),
            file_retry: RetryPolicy::new(3, Duration::from_secs(2)).fixed(),
            admission_interval: Duration::from_secs(1),
            drain_on_shutdown: false,
            scan_existing_on_start: true,
        }
    }
}

impl WatchConfig {
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug)]
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn file_stable_for(mut self, d: Duration) -> Self {
        self.config.file_stable_for = d;
        self
    }

    pub fn dir_stable_for(mut self, d: Duration) -> Self {
        self.config.dir_stable_for = d;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(36, 1200);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn bilevel_threshold(mut self, t: u8) -> Self {
        self.config.bilevel_threshold = t;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn file_concurrency(mut self, n: usize) -> Self {
        self.config.file_concurrency = n.max(1);
        self
    }

    pub fn move_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.move_retry = policy;
        self
    }

    pub fn page_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.page_retry = policy;
        self
    }

    pub fn file_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.file_retry = policy;
        self
    }

    pub fn admission_interval(mut self, d: Duration) -> Self {
        self.config.admission_interval = d;
        self
    }

    pub fn drain_on_shutdown(mut self, v: bool) -> Self {
        self.config.drain_on_shutdown = v;
        self
    }

    pub fn scan_existing_on_start(mut self, v: bool) -> Self {
        self.config.scan_existing_on_start = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WatchConfig, HotfolderError> {
        let c = &self.config;
        if c.poll_interval.is_zero() {
            return Err(HotfolderError::InvalidConfig(
                "poll interval must be greater than zero".into(),
            ));
        }
        if c.admission_interval.is_zero() {
            return Err(HotfolderError::InvalidConfig(
                "admission interval must be greater than zero".into(),
            ));
        }
        for (name, policy) in [
            ("move", &c.move_retry),
            ("page", &c.page_retry),
            ("file", &c.file_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(HotfolderError::InvalidConfig(format!(
                    "{name} retry policy needs at least one attempt"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// The two processor kinds every profile runs.
///
/// | Kind | Colour model | Encoding | Extension |
/// |------|--------------|----------|-----------|
/// | `Jpeg` | 24-bit RGB | lossy, quality 60 | `.jpg` |
/// | `Tiff` | 1-bit, threshold 128 | group-4 bi-level | `.tif` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutputKind {
    Jpeg,
    Tiff,
}

impl OutputKind {
    pub const ALL: [OutputKind; 2] = [OutputKind::Jpeg, OutputKind::Tiff];

    /// Extension of the files this kind produces.
    pub fn extension(self) -> &'static str {
        match self {
            OutputKind::Jpeg => "jpg",
            OutputKind::Tiff => "tif",
        }
    }

    /// Directory name of this kind's watch root inside a profile.
    pub fn dir_name(self) -> &'static str {
        match self {
            OutputKind::Jpeg => "JPEG",
            OutputKind::Tiff => "TIFF",
        }
    }

    /// Classify a source path for this kind. `None` means "ignore".
    ///
    /// A kind never accepts its own output format, so outputs written next to
    /// their sources are never picked up again.
    pub fn classify(self, path: &Path) -> Option<SourceKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match (self, ext.as_str()) {
            (_, "pdf") => Some(SourceKind::Pdf),
            (OutputKind::Jpeg, "png" | "tif" | "tiff" | "bmp") => Some(SourceKind::Image),
            (OutputKind::Tiff, "jpg" | "jpeg" | "png" | "bmp") => Some(SourceKind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for OutputKind {
    type Err = HotfolderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputKind::Jpeg),
            "tiff" | "tif" => Ok(OutputKind::Tiff),
            other => Err(HotfolderError::InvalidConfig(format!(
                "unknown output kind '{other}' (expected jpeg or tiff)"
            ))),
        }
    }
}

/// What a supported source file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Multi-page document, one image per page.
    Pdf,
    /// Single raster image, converted one to one.
    Image,
}
