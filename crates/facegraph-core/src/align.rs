//! Face alignment: crop a located region (or a deterministic center-crop
//! fallback) into the fixed-size tile the embedding model expects.
//!
//! The fallback guarantees the pipeline always produces *some* tile,
//! trading accuracy for availability; [`AlignmentSource`] tells callers
//! which path ran.

use crate::types::{AlignedFace, AlignmentSource, BoundingBox};
use image::RgbImage;

/// Alignment tunables.
#[derive(Debug, Clone)]
pub struct AlignConfig {
    /// Side length of the output tile in pixels.
    pub tile_size: u32,
    /// Square crop side as a multiple of the larger box dimension.
    pub expansion: f32,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self { tile_size: 160, expansion: 2.0 }
    }
}

/// Produce a fixed-size face tile from a normalized image.
///
/// With a located box: crop a square of `expansion × max(w, h)` centered
/// on the box, clamped to image bounds. Without one: center-crop a square
/// of the smaller image dimension.
pub fn align_face(image: &RgbImage, face: Option<&BoundingBox>, config: &AlignConfig) -> AlignedFace {
    let (region, source) = match face {
        Some(bbox) => (face_crop_region(image, bbox, config.expansion), AlignmentSource::Detected),
        None => (center_crop_region(image), AlignmentSource::Fallback),
    };

    let (x, y, side) = region;
    let crop = image::imageops::crop_imm(image, x, y, side, side).to_image();
    let tile = image::imageops::resize(
        &crop,
        config.tile_size,
        config.tile_size,
        image::imageops::FilterType::Triangle,
    );

    AlignedFace { tile, source }
}

/// Square region around a detected box: side `expansion × max(w, h)`,
/// centered on the box center, clamped so it stays inside the image.
fn face_crop_region(image: &RgbImage, bbox: &BoundingBox, expansion: f32) -> (u32, u32, u32) {
    let (img_w, img_h) = image.dimensions();

    let side = (bbox.width.max(bbox.height) * expansion)
        .round()
        .clamp(1.0, img_w.min(img_h) as f32) as u32;

    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;

    let x = (cx - side as f32 / 2.0)
        .round()
        .clamp(0.0, (img_w - side) as f32) as u32;
    let y = (cy - side as f32 / 2.0)
        .round()
        .clamp(0.0, (img_h - side) as f32) as u32;

    (x, y, side)
}

/// Deterministic whole-image fallback: centered square of the smaller
/// image dimension.
fn center_crop_region(image: &RgbImage) -> (u32, u32, u32) {
    let (img_w, img_h) = image.dimensions();
    let side = img_w.min(img_h).max(1);
    ((img_w - side) / 2, (img_h - side) / 2, side)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_detected_tile_is_configured_size() {
        let img = RgbImage::from_pixel(640, 480, image::Rgb([50, 50, 50]));
        let config = AlignConfig::default();
        let out = align_face(&img, Some(&bbox(200.0, 150.0, 80.0, 100.0)), &config);
        assert_eq!(out.tile.dimensions(), (160, 160));
        assert_eq!(out.source, AlignmentSource::Detected);
    }

    #[test]
    fn test_fallback_tile_is_configured_size() {
        let img = RgbImage::from_pixel(300, 500, image::Rgb([50, 50, 50]));
        let out = align_face(&img, None, &AlignConfig::default());
        assert_eq!(out.tile.dimensions(), (160, 160));
        assert_eq!(out.source, AlignmentSource::Fallback);
    }

    #[test]
    fn test_tiny_source_still_produces_tile() {
        let img = RgbImage::from_pixel(8, 6, image::Rgb([50, 50, 50]));
        let out = align_face(&img, None, &AlignConfig::default());
        assert_eq!(out.tile.dimensions(), (160, 160));
    }

    #[test]
    fn test_region_expansion_and_centering() {
        let img = RgbImage::from_pixel(640, 480, image::Rgb([0, 0, 0]));
        // max(80, 100) × 2.0 = 200, centered on (240, 200)
        let (x, y, side) = face_crop_region(&img, &bbox(200.0, 150.0, 80.0, 100.0), 2.0);
        assert_eq!(side, 200);
        assert_eq!(x, 140);
        assert_eq!(y, 100);
    }

    #[test]
    fn test_region_clamped_to_image_bounds() {
        let img = RgbImage::from_pixel(640, 480, image::Rgb([0, 0, 0]));
        // Box near the origin: expanded square would start negative
        let (x, y, side) = face_crop_region(&img, &bbox(5.0, 5.0, 60.0, 60.0), 2.0);
        assert_eq!(x, 0);
        assert_eq!(y, 0);
        assert!(x + side <= 640 && y + side <= 480);
    }

    #[test]
    fn test_region_side_capped_by_smaller_dimension() {
        let img = RgbImage::from_pixel(640, 480, image::Rgb([0, 0, 0]));
        let (_, _, side) = face_crop_region(&img, &bbox(100.0, 100.0, 400.0, 300.0), 2.0);
        assert_eq!(side, 480);
    }

    #[test]
    fn test_center_crop_is_deterministic_and_centered() {
        let img = RgbImage::from_pixel(300, 100, image::Rgb([0, 0, 0]));
        assert_eq!(center_crop_region(&img), (100, 0, 100));

        let img = RgbImage::from_pixel(100, 300, image::Rgb([0, 0, 0]));
        assert_eq!(center_crop_region(&img), (0, 100, 100));
    }

    #[test]
    fn test_crop_picks_expected_pixels() {
        // Bright pixel at the image center must survive a fallback crop.
        let mut img = RgbImage::from_pixel(200, 100, image::Rgb([0, 0, 0]));
        img.put_pixel(100, 50, image::Rgb([255, 255, 255]));
        let out = align_face(&img, None, &AlignConfig { tile_size: 100, expansion: 2.0 });
        assert_eq!(out.tile.get_pixel(50, 50).0, [255, 255, 255]);
    }
}
