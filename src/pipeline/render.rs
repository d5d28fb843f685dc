//! Document rasterisation and source image decoding.
//!
//! Rendering goes through the [`PageRenderer`] trait so the conversion
//! pipeline never depends on a particular PDF library. The default
//! [`PdfiumRenderer`] wraps pdfium via `pdfium-render`.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-heavy calls.
//! Every trait call is moved onto the blocking pool by the async helpers
//! below so Tokio worker threads never stall during a render.

use crate::error::RenderError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Turns a document into page rasters.
///
/// Implementations are called from the blocking pool, possibly for several
/// pages of the same document at once.
pub trait PageRenderer: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self, path: &Path) -> Result<usize, RenderError>;

    /// Rasterise page `index` (0-based) at `dpi`.
    fn render_page(&self, path: &Path, index: usize, dpi: u32)
        -> Result<DynamicImage, RenderError>;
}

/// pdfium-backed renderer.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRenderer {
    /// The pdfium shared library, or the directory holding it. `None` binds
    /// to the system library.
    library: Option<PathBuf>,
}

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to a specific library file, or to the platform library name
    /// inside a directory.
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, RenderError> {
        let bindings = match &self.library {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| RenderError::Backend(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }
}

fn open_error(path: &Path, e: PdfiumError) -> RenderError {
    if !path.exists() {
        RenderError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        RenderError::Open {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        }
    }
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, path: &Path) -> Result<usize, RenderError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| open_error(path, e))?;
        Ok(document.pages().len() as usize)
    }

    fn render_page(
        &self,
        path: &Path,
        index: usize,
        dpi: u32,
    ) -> Result<DynamicImage, RenderError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| open_error(path, e))?;

        let page = document
            .pages()
            .get(index as u16)
            .map_err(|e| RenderError::Page {
                page: index + 1,
                detail: format!("{:?}", e),
            })?;

        // PDF user space is 72 units per inch.
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError::Page {
                page: index + 1,
                detail: format!("{:?}", e),
            })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

/// Page count on the blocking pool.
pub async fn page_count(
    renderer: &Arc<dyn PageRenderer>,
    path: &Path,
) -> Result<usize, RenderError> {
    let renderer = Arc::clone(renderer);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || renderer.page_count(&path))
        .await
        .map_err(|e| RenderError::Backend(format!("Render task panicked: {}", e)))?
}

/// Single page render on the blocking pool.
pub async fn render_page(
    renderer: &Arc<dyn PageRenderer>,
    path: &Path,
    index: usize,
    dpi: u32,
) -> Result<DynamicImage, RenderError> {
    let renderer = Arc::clone(renderer);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || renderer.render_page(&path, index, dpi))
        .await
        .map_err(|e| RenderError::Page {
            page: index + 1,
            detail: format!("Render task panicked: {}", e),
        })?
}

/// Decode a single source image.
pub async fn load_image(path: &Path) -> Result<DynamicImage, RenderError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !path.exists() {
            return Err(RenderError::NotFound { path });
        }
        image::open(&path).map_err(|e| RenderError::Open {
            path: path.clone(),
            detail: e.to_string(),
        })
    })
    .await
    .map_err(|e| RenderError::Backend(format!("Decode task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[tokio::test]
    async fn load_image_decodes_png() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("dot.png");
        RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])).save(&p).unwrap();

        let img = load_image(&p).await.unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
    }

    #[tokio::test]
    async fn load_image_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(&dir.path().join("none.png")).await.unwrap_err();
        assert!(matches!(err, RenderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn load_image_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("broken.png");
        std::fs::write(&p, b"definitely not a png").unwrap();
        let err = load_image(&p).await.unwrap_err();
        assert!(matches!(err, RenderError::Open { .. }));
    }
}
