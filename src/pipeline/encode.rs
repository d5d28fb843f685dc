//! Colour conversion and image encoding.
//!
//! The pipeline asks an [`ImageEncoder`] to write a raster with a target
//! colour model and format options. [`StandardEncoder`] covers both output
//! kinds with the `image` crate:
//!
//! * JPEG — 24-bit RGB, lossy with the configured quality, density tagged.
//! * TIFF — thresholded to pure black and white, packed at one bit per
//!   pixel and compressed with CCITT group 4 (`fax`), in a single-strip
//!   `WhiteIsZero` IFD written with `tiff`. Resolution tags carry the DPI.

use crate::config::{OutputKind, WatchConfig};
use crate::error::EncodeError;
use image::codecs::jpeg::{JpegEncoder, PixelDensity};
use fax::encoder::Encoder as FaxEncoder;
use fax::{Color, VecWriter};
use image::{DynamicImage, GrayImage, Luma};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tiff::encoder::{Rational, TiffEncoder};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, ResolutionUnit, Tag};
use tiff::TiffError;
use tracing::debug;

/// Target colour model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// 8 bits per channel RGB.
    Rgb24,
    /// Black/white; luma strictly below `threshold` becomes black.
    BiLevel { threshold: u8 },
}

/// Format-specific options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Jpeg { quality: u8 },
    Group4,
}

/// Everything an encoder needs besides the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub color: ColorModel,
    pub compression: Compression,
    pub dpi: u32,
}

impl EncodeOptions {
    /// Options for an output kind under the given configuration.
    pub fn for_kind(kind: OutputKind, config: &WatchConfig) -> Self {
        match kind {
            OutputKind::Jpeg => Self {
                color: ColorModel::Rgb24,
                compression: Compression::Jpeg {
                    quality: config.jpeg_quality,
                },
                dpi: config.dpi,
            },
            OutputKind::Tiff => Self {
                color: ColorModel::BiLevel {
                    threshold: config.bilevel_threshold,
                },
                compression: Compression::Group4,
                dpi: config.dpi,
            },
        }
    }
}

/// Writes an encoded image file.
///
/// Called from the blocking pool; several pages may be encoded at once, so
/// implementations must not rely on call order.
pub trait ImageEncoder: Send + Sync {
    fn encode(
        &self,
        image: &DynamicImage,
        options: &EncodeOptions,
        out: &Path,
    ) -> Result<(), EncodeError>;
}

/// Convert a raster to the requested colour model.
pub fn to_color_model(image: &DynamicImage, color: ColorModel) -> DynamicImage {
    match color {
        ColorModel::Rgb24 => DynamicImage::ImageRgb8(image.to_rgb8()),
        ColorModel::BiLevel { threshold } => DynamicImage::ImageLuma8(threshold_luma(image, threshold)),
    }
}

fn threshold_luma(image: &DynamicImage, threshold: u8) -> GrayImage {
    let mut gray = image.to_luma8();
    for Luma([v]) in gray.pixels_mut() {
        *v = if *v < threshold { 0 } else { 255 };
    }
    gray
}

/// Compress a thresholded raster, black where the sample is 0.
fn group4_strip(bilevel: &GrayImage) -> Result<Vec<u8>, EncodeError> {
    let width = u16::try_from(bilevel.width()).map_err(|_| EncodeError::TooWide {
        width: bilevel.width(),
    })?;
    let mut encoder = FaxEncoder::new(VecWriter::new());
    for row in bilevel.rows() {
        let pels = row.map(|Luma([v])| if *v == 0 { Color::Black } else { Color::White });
        encoder.encode_line(pels, width).unwrap_or_else(|e| match e {});
    }
    let bits = encoder.finish().unwrap_or_else(|e| match e {});
    Ok(bits.finish())
}

fn write_group4_tiff<W: Write + Seek>(
    writer: W,
    bilevel: &GrayImage,
    strip: &[u8],
    dpi: u32,
) -> Result<(), TiffError> {
    let too_large = |_: std::num::TryFromIntError| TiffError::LimitsExceeded;
    let mut tiff = TiffEncoder::new(writer)?;
    let mut dir = tiff.image_directory()?;
    let offset = dir.write_data(strip)?;
    let resolution = Rational { n: dpi, d: 1 };

    dir.write_tag(Tag::ImageWidth, bilevel.width())?;
    dir.write_tag(Tag::ImageLength, bilevel.height())?;
    dir.write_tag(Tag::BitsPerSample, 1u16)?;
    dir.write_tag(Tag::Compression, CompressionMethod::Fax4)?;
    dir.write_tag(
        Tag::PhotometricInterpretation,
        PhotometricInterpretation::WhiteIsZero,
    )?;
    dir.write_tag(Tag::SamplesPerPixel, 1u16)?;
    dir.write_tag(Tag::RowsPerStrip, bilevel.height())?;
    dir.write_tag(Tag::StripOffsets, u32::try_from(offset).map_err(too_large)?)?;
    dir.write_tag(Tag::StripByteCounts, u32::try_from(strip.len()).map_err(too_large)?)?;
    dir.write_tag(Tag::XResolution, resolution.clone())?;
    dir.write_tag(Tag::YResolution, resolution)?;
    dir.write_tag(Tag::ResolutionUnit, ResolutionUnit::Inch)?;
    dir.finish()
}

/// Encoder for both output kinds: `image` for JPEG, `fax` and `tiff` for
/// group-4 TIFF.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardEncoder;

impl ImageEncoder for StandardEncoder {
    fn encode(
        &self,
        image: &DynamicImage,
        options: &EncodeOptions,
        out: &Path,
    ) -> Result<(), EncodeError> {
        let io_err = |source| EncodeError::Io {
            path: out.to_path_buf(),
            source,
        };
        let file = File::create(out).map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        let converted = to_color_model(image, options.color);
        match options.compression {
            Compression::Jpeg { quality } => {
                let rgb = converted.to_rgb8();
                let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
                encoder.set_pixel_density(PixelDensity::dpi(options.dpi.min(u16::MAX as u32) as u16));
                encoder.encode_image(&rgb)?;
            }
            Compression::Group4 => {
                let bilevel = converted.to_luma8();
                let strip = group4_strip(&bilevel)?;
                write_group4_tiff(&mut writer, &bilevel, &strip, options.dpi)?;
            }
        }
        writer.flush().map_err(io_err)?;
        debug!("Encoded {} ({:?})", out.display(), options.compression);
        Ok(())
    }
}
