//! Pipeline stages for turning an arrived file into output images.
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ render ──▶ colour model ──▶ encode ──▶ .part ──▶ rename
//! (pdf/img)  (pdfium)   (rgb / 1-bit)    (jpg/tif)
//! ```
//!
//! 1. [`render`] — rasterise document pages or decode a source image; runs in
//!    `spawn_blocking` because pdfium and the codecs are CPU-bound
//! 2. [`encode`] — convert to the target colour model and write the file
//!
//! Orchestration of the stages (retries, failure isolation, source deletion)
//! lives in [`crate::convert`].

pub mod encode;
pub mod render;
