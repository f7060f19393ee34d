//! Image normalization: decode, orientation correction, mild contrast boost.
//!
//! Produces the canonical RGB buffer every downstream stage consumes.
//! Enhancement failures degrade to the plain decode; only an undecodable
//! input is an error.

use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Contrast factors outside this range distort facial features enough to
/// hurt embedding quality, so the config value is clamped into it.
const CONTRAST_MIN: f32 = 1.0;
const CONTRAST_MAX: f32 = 1.2;

#[derive(Error, Debug)]
#[error("cannot decode input as an image: {0}")]
pub struct ImageDecodeError(#[from] image::ImageError);

/// Normalization settings.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Contrast factor applied around the midpoint, clamped to [1.0, 1.2].
    pub contrast: f32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self { contrast: 1.1 }
    }
}

/// Decode arbitrary image bytes into an orientation-corrected RGB buffer.
///
/// Orientation comes from embedded EXIF metadata (phones commonly store
/// rotated pixels plus a tag instead of rotating). If enhancement fails
/// the plain RGB decode is returned instead of an error.
pub fn normalize_image(bytes: &[u8], config: &NormalizeConfig) -> Result<RgbImage, ImageDecodeError> {
    let decoded = image::load_from_memory(bytes)?;

    match enhance(bytes, &decoded, config) {
        Ok(img) => Ok(img),
        Err(err) => {
            tracing::warn!(error = %err, "image enhancement failed; using plain decode");
            Ok(decoded.to_rgb8())
        }
    }
}

fn enhance(
    bytes: &[u8],
    decoded: &DynamicImage,
    config: &NormalizeConfig,
) -> Result<RgbImage, ImageDecodeError> {
    let oriented = apply_orientation(decoded.clone(), exif_orientation(bytes));
    let mut rgb = oriented.to_rgb8();

    let factor = config.contrast.clamp(CONTRAST_MIN, CONTRAST_MAX);
    if factor > CONTRAST_MIN {
        adjust_contrast(&mut rgb, factor);
    }

    Ok(rgb)
}

/// Read the EXIF orientation tag (1–8), defaulting to 1 (normal) when the
/// container has no EXIF segment or the tag is absent.
fn exif_orientation(bytes: &[u8]) -> u8 {
    exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()
        .and_then(|data| {
            data.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .map(|v| v as u8)
        .unwrap_or(1)
}

fn apply_orientation(image: DynamicImage, orientation: u8) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Scale pixel values away from the midpoint by `factor`.
fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for c in pixel.0.iter_mut() {
            let v = (*c as f32 - 128.0) * factor + 128.0;
            *c = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_failure_is_error() {
        let result = normalize_image(b"not an image", &NormalizeConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_dimensions() {
        let img = RgbImage::from_pixel(32, 24, image::Rgb([90, 90, 90]));
        let out = normalize_image(&png_bytes(&img), &NormalizeConfig::default()).unwrap();
        assert_eq!(out.dimensions(), (32, 24));
    }

    #[test]
    fn test_contrast_clamped_to_bounds() {
        // Factor beyond the allowed range must behave like the max factor.
        let mut capped = RgbImage::from_pixel(4, 4, image::Rgb([100, 100, 100]));
        adjust_contrast(&mut capped, 1.2);

        let img = RgbImage::from_pixel(4, 4, image::Rgb([100, 100, 100]));
        let wild = normalize_image(&png_bytes(&img), &NormalizeConfig { contrast: 9.0 }).unwrap();
        assert_eq!(wild.get_pixel(0, 0).0, capped.get_pixel(0, 0).0);
    }

    #[test]
    fn test_contrast_moves_away_from_midpoint() {
        let mut img = RgbImage::from_pixel(2, 2, image::Rgb([100, 128, 200]));
        adjust_contrast(&mut img, 1.2);
        let p = img.get_pixel(0, 0).0;
        assert!(p[0] < 100); // below midpoint moves down
        assert_eq!(p[1], 128); // midpoint is a fixed point
        assert!(p[2] > 200); // above midpoint moves up
    }

    #[test]
    fn test_orientation_rotate180() {
        let mut img = RgbImage::from_pixel(2, 1, image::Rgb([0, 0, 0]));
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let rotated = apply_orientation(DynamicImage::ImageRgb8(img), 3).to_rgb8();
        assert_eq!(rotated.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_no_exif_defaults_to_normal() {
        let img = RgbImage::from_pixel(3, 3, image::Rgb([10, 20, 30]));
        assert_eq!(exif_orientation(&png_bytes(&img)), 1);
    }
}
