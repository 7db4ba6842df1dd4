//! Image decoding with sub-sampling
//!
//! Fetched bytes are decoded to pixels sized for a caller-supplied [`TargetBox`]. The header is
//! probed first so decode limits are enforced before any pixel buffer is allocated, then the
//! image is reduced by a power-of-two sample factor chosen by [`compute_sample_factor`].

use crate::error::{Error, ImageError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// Bounds the decoded image should fit. `0` on an axis means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TargetBox {
  pub width: u32,
  pub height: u32,
}

impl TargetBox {
  /// No downsampling.
  pub const UNBOUNDED: TargetBox = TargetBox {
    width: 0,
    height: 0,
  };

  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn is_bounded(&self) -> bool {
    self.width > 0 && self.height > 0
  }
}

/// Largest power-of-two factor that keeps both decoded dimensions above the target.
///
/// Returns 1 when either target dimension is unset. Otherwise the factor doubles while
/// `(natural_height / 2) / factor > target_height` and `(natural_width / 2) / factor >
/// target_width`.
///
/// ```
/// use imagefetch::compute_sample_factor;
///
/// assert_eq!(compute_sample_factor(4000, 3000, 1000, 1000), 2);
/// assert_eq!(compute_sample_factor(500, 500, 1000, 1000), 1);
/// ```
pub fn compute_sample_factor(
  natural_width: u32,
  natural_height: u32,
  target_width: u32,
  target_height: u32,
) -> u32 {
  if target_width == 0 || target_height == 0 {
    return 1;
  }
  let mut factor = 1u32;
  if natural_height > target_height || natural_width > target_width {
    let half_height = natural_height / 2;
    let half_width = natural_width / 2;
    while half_height / factor > target_height && half_width / factor > target_width {
      factor *= 2;
    }
  }
  factor
}

/// Pixels plus the facts about how they were produced.
#[derive(Debug, Clone)]
pub struct DecodedImage {
  image: DynamicImage,
  natural_width: u32,
  natural_height: u32,
  sample_factor: u32,
  format: Option<ImageFormat>,
}

impl DecodedImage {
  pub fn new(image: DynamicImage, sample_factor: u32, format: Option<ImageFormat>) -> Self {
    Self {
      natural_width: image.width().saturating_mul(sample_factor),
      natural_height: image.height().saturating_mul(sample_factor),
      image,
      sample_factor,
      format,
    }
  }

  pub fn image(&self) -> &DynamicImage {
    &self.image
  }

  pub fn into_image(self) -> DynamicImage {
    self.image
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  /// Dimensions declared by the encoded image.
  pub fn natural_dimensions(&self) -> (u32, u32) {
    (self.natural_width, self.natural_height)
  }

  pub fn sample_factor(&self) -> u32 {
    self.sample_factor
  }

  pub fn format(&self) -> Option<ImageFormat> {
    self.format
  }

  /// Bytes held by the pixel buffer.
  pub fn byte_size(&self) -> u64 {
    self.image.as_bytes().len() as u64
  }
}

/// Limits checked against the header before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
  /// Maximum number of decoded pixels (width * height). `0` disables the limit.
  pub max_decoded_pixels: u64,
  /// Maximum allowed width or height for a decoded image. `0` disables the limit.
  pub max_decoded_dimension: u32,
}

impl Default for DecodeLimits {
  fn default() -> Self {
    Self {
      max_decoded_pixels: 100_000_000,
      max_decoded_dimension: 32768,
    }
  }
}

impl DecodeLimits {
  pub fn with_max_decoded_pixels(mut self, max: u64) -> Self {
    self.max_decoded_pixels = max;
    self
  }

  pub fn with_max_decoded_dimension(mut self, max: u32) -> Self {
    self.max_decoded_dimension = max;
    self
  }

  fn enforce(&self, width: u32, height: u32) -> Result<()> {
    if self.max_decoded_dimension > 0
      && (width > self.max_decoded_dimension || height > self.max_decoded_dimension)
    {
      return Err(Error::Image(ImageError::TooLarge {
        width,
        height,
        reason: format!("maximum dimension is {}", self.max_decoded_dimension),
      }));
    }
    if self.max_decoded_pixels > 0 {
      let pixels = u64::from(width) * u64::from(height);
      if pixels > self.max_decoded_pixels {
        return Err(Error::Image(ImageError::TooLarge {
          width,
          height,
          reason: format!("pixel budget is {}", self.max_decoded_pixels),
        }));
      }
    }
    Ok(())
  }
}

/// Turns encoded bytes into a [`DecodedImage`] that fits a target box.
pub trait BitmapDecoder: Send + Sync {
  fn decode(&self, bytes: &[u8], target: TargetBox) -> Result<DecodedImage>;

  fn decode_file(&self, path: &Path, target: TargetBox) -> Result<DecodedImage> {
    let bytes = fs::read(path)?;
    self.decode(&bytes, target)
  }
}

impl<T: BitmapDecoder + ?Sized> BitmapDecoder for Arc<T> {
  fn decode(&self, bytes: &[u8], target: TargetBox) -> Result<DecodedImage> {
    (**self).decode(bytes, target)
  }

  fn decode_file(&self, path: &Path, target: TargetBox) -> Result<DecodedImage> {
    (**self).decode_file(path, target)
  }
}

/// [`BitmapDecoder`] backed by the `image` crate.
///
/// Decodes at full resolution and then reduces by the sample factor, so peak memory is that of
/// the full image; [`DecodeLimits`] bound it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampledDecoder {
  limits: DecodeLimits,
}

impl SampledDecoder {
  pub fn new(limits: DecodeLimits) -> Self {
    Self { limits }
  }

  pub fn limits(&self) -> DecodeLimits {
    self.limits
  }

  fn dimensions_for_format(bytes: &[u8], format: ImageFormat) -> Option<(u32, u32)> {
    match format {
      ImageFormat::Png => image::codecs::png::PngDecoder::new(Cursor::new(bytes))
        .ok()
        .map(|d| d.dimensions()),
      ImageFormat::Jpeg => image::codecs::jpeg::JpegDecoder::new(Cursor::new(bytes))
        .ok()
        .map(|d| d.dimensions()),
      ImageFormat::Gif => image::codecs::gif::GifDecoder::new(Cursor::new(bytes))
        .ok()
        .map(|d| d.dimensions()),
      ImageFormat::WebP => image::codecs::webp::WebPDecoder::new(Cursor::new(bytes))
        .ok()
        .map(|d| d.dimensions()),
      ImageFormat::Bmp => image::codecs::bmp::BmpDecoder::new(Cursor::new(bytes))
        .ok()
        .map(|d| d.dimensions()),
      _ => None,
    }
  }
}

impl BitmapDecoder for SampledDecoder {
  fn decode(&self, bytes: &[u8], target: TargetBox) -> Result<DecodedImage> {
    if bytes.is_empty() {
      return Err(decode_failed("empty input"));
    }
    let format = sniff_image_format(bytes).ok_or_else(|| decode_failed("unrecognized format"))?;
    let (width, height) = Self::dimensions_for_format(bytes, format)
      .ok_or_else(|| decode_failed(format!("unreadable {format:?} header")))?;
    self.limits.enforce(width, height)?;

    let factor = compute_sample_factor(width, height, target.width, target.height);
    let image = image::load_from_memory_with_format(bytes, format)
      .map_err(|err| decode_failed(err.to_string()))?;
    let image = if factor > 1 {
      let sampled_width = (image.width() / factor).max(1);
      let sampled_height = (image.height() / factor).max(1);
      image.resize_exact(sampled_width, sampled_height, FilterType::Triangle)
    } else {
      image
    };
    Ok(DecodedImage {
      image,
      natural_width: width,
      natural_height: height,
      sample_factor: factor,
      format: Some(format),
    })
  }
}

/// Format detected from magic bytes, if any.
pub fn sniff_image_format(bytes: &[u8]) -> Option<ImageFormat> {
  image::guess_format(bytes).ok()
}

fn decode_failed(reason: impl Into<String>) -> Error {
  Error::Image(ImageError::DecodeFailed {
    reason: reason.into(),
  })
}

#[cfg(test)]
pub(crate) mod test_support {
  use image::{ImageFormat, Rgba, RgbaImage};
  use std::io::Cursor;

  /// Encodes a solid-color PNG.
  pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    image
      .write_to(&mut out, ImageFormat::Png)
      .expect("encode png");
    out.into_inner()
  }
}

#[cfg(test)]
mod tests {
  use super::test_support::png_bytes;
  use super::*;

  #[test]
  fn sample_factor_matches_reference_values() {
    assert_eq!(compute_sample_factor(4000, 3000, 1000, 1000), 2);
    assert_eq!(compute_sample_factor(500, 500, 1000, 1000), 1);
    assert_eq!(compute_sample_factor(4000, 4000, 100, 100), 16);
    assert_eq!(compute_sample_factor(4000, 3000, 0, 1000), 1);
    assert_eq!(compute_sample_factor(4000, 3000, 1000, 0), 1);
  }

  #[test]
  fn sampled_dimensions_stay_above_target() {
    for (w, h, tw, th) in [(4000, 3000, 1000, 1000), (1024, 768, 100, 90), (333, 999, 40, 40)] {
      let factor = compute_sample_factor(w, h, tw, th);
      assert!(factor.is_power_of_two());
      assert!(w / factor >= tw || h / factor >= th);
    }
  }

  #[test]
  fn decodes_and_downsamples_png() {
    let decoder = SampledDecoder::default();
    let bytes = png_bytes(64, 48);
    let full = decoder.decode(&bytes, TargetBox::UNBOUNDED).unwrap();
    assert_eq!((full.width(), full.height()), (64, 48));
    assert_eq!(full.sample_factor(), 1);
    assert_eq!(full.format(), Some(ImageFormat::Png));

    let small = decoder.decode(&bytes, TargetBox::new(20, 20)).unwrap();
    assert_eq!(small.sample_factor(), 2);
    assert_eq!((small.width(), small.height()), (32, 24));
    assert_eq!(small.natural_dimensions(), (64, 48));
    assert_eq!(small.byte_size(), 32 * 24 * 4);
  }

  #[test]
  fn rejects_garbage() {
    let decoder = SampledDecoder::default();
    let err = decoder
      .decode(b"<html>not an image</html>", TargetBox::UNBOUNDED)
      .unwrap_err();
    assert!(matches!(err, Error::Image(ImageError::DecodeFailed { .. })));
    assert!(decoder.decode(&[], TargetBox::UNBOUNDED).is_err());
  }

  #[test]
  fn enforces_limits_before_decoding() {
    let decoder = SampledDecoder::new(DecodeLimits::default().with_max_decoded_dimension(32));
    let err = decoder
      .decode(&png_bytes(64, 8), TargetBox::UNBOUNDED)
      .unwrap_err();
    assert!(matches!(
      err,
      Error::Image(ImageError::TooLarge { width: 64, .. })
    ));

    let decoder = SampledDecoder::new(DecodeLimits::default().with_max_decoded_pixels(100));
    assert!(decoder.decode(&png_bytes(11, 10), TargetBox::UNBOUNDED).is_err());
    assert!(decoder.decode(&png_bytes(10, 10), TargetBox::UNBOUNDED).is_ok());
  }

  #[test]
  fn decode_file_reads_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.png");
    fs::write(&path, png_bytes(8, 8)).unwrap();
    let image = SampledDecoder::default()
      .decode_file(&path, TargetBox::UNBOUNDED)
      .unwrap();
    assert_eq!(image.width(), 8);
    assert!(SampledDecoder::default()
      .decode_file(&dir.path().join("missing.png"), TargetBox::UNBOUNDED)
      .is_err());
  }
}
