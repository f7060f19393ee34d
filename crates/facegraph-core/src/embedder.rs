//! Embedding extraction from aligned face tiles.
//!
//! The neural network is an opaque capability behind [`EmbeddingModel`]:
//! given a fixed-size RGB tile, produce a D-dimensional raw vector. The
//! default implementation runs a FaceNet-style ONNX export; the generator
//! wraps whichever model is plugged in, enforces the configured dimension
//! and unit-normalizes the output.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const EMBED_TILE_SIZE: u32 = 160;
pub const EMBEDDING_DIM: usize = 512;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5; // symmetric normalization, NOT the detector's 128.0

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download a FaceNet export and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque embedding capability: aligned RGB tile → raw feature vector.
pub trait EmbeddingModel: Send + Sync {
    fn infer(&self, tile: &RgbImage) -> Result<Vec<f32>, EmbedderError>;
}

/// FaceNet-style ONNX embedding model (160×160 RGB in, 512 floats out).
pub struct OnnxEmbedder {
    session: Mutex<Session>,
}

impl OnnxEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    /// Preprocess an RGB tile into a NCHW float tensor matching the
    /// model's training distribution.
    fn preprocess(tile: &RgbImage) -> Array4<f32> {
        let (width, height) = tile.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in tile.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - EMBED_MEAN) / EMBED_STD;
            }
        }

        tensor
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn infer(&self, tile: &RgbImage) -> Result<Vec<f32>, EmbedderError> {
        let input = Self::preprocess(tile);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("session mutex poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Wraps an [`EmbeddingModel`] and turns its raw output into validated,
/// unit-normalized embeddings.
pub struct EmbeddingGenerator {
    model: Box<dyn EmbeddingModel>,
    dimension: usize,
}

impl EmbeddingGenerator {
    pub fn new(model: Box<dyn EmbeddingModel>, dimension: usize) -> Self {
        Self { model, dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Extract a unit-normalized embedding from an aligned tile.
    ///
    /// Model failure means "identification impossible for this input";
    /// callers do not retry.
    pub fn generate(&self, tile: &RgbImage) -> Result<Embedding, EmbedderError> {
        let raw = self.model.infer(tile)?;

        if raw.len() != self.dimension {
            return Err(EmbedderError::DimensionMismatch {
                expected: self.dimension,
                got: raw.len(),
            });
        }

        Ok(Embedding::from_raw(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModel(Vec<f32>);

    impl EmbeddingModel for FixedModel {
        fn infer(&self, _tile: &RgbImage) -> Result<Vec<f32>, EmbedderError> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl EmbeddingModel for FailingModel {
        fn infer(&self, _tile: &RgbImage) -> Result<Vec<f32>, EmbedderError> {
            Err(EmbedderError::InferenceFailed("synthetic failure".into()))
        }
    }

    fn tile() -> RgbImage {
        RgbImage::from_pixel(EMBED_TILE_SIZE, EMBED_TILE_SIZE, image::Rgb([128, 128, 128]))
    }

    #[test]
    fn test_generate_unit_norm() {
        let generator = EmbeddingGenerator::new(Box::new(FixedModel(vec![3.0, 0.0, 4.0])), 3);
        let e = generator.generate(&tile()).unwrap();
        assert!((e.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_generate_zero_vector_passes_through() {
        let generator = EmbeddingGenerator::new(Box::new(FixedModel(vec![0.0; 4])), 4);
        let e = generator.generate(&tile()).unwrap();
        assert_eq!(e.values, vec![0.0; 4]);
    }

    #[test]
    fn test_generate_dimension_mismatch() {
        let generator = EmbeddingGenerator::new(Box::new(FixedModel(vec![1.0, 2.0])), 512);
        let err = generator.generate(&tile()).unwrap_err();
        assert!(matches!(err, EmbedderError::DimensionMismatch { expected: 512, got: 2 }));
    }

    #[test]
    fn test_generate_propagates_model_failure() {
        let generator = EmbeddingGenerator::new(Box::new(FailingModel), 512);
        assert!(matches!(
            generator.generate(&tile()),
            Err(EmbedderError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let t = RgbImage::from_pixel(160, 160, image::Rgb([255, 128, 0]));
        let tensor = OnnxEmbedder::preprocess(&t);
        assert_eq!(tensor.shape(), &[1, 3, 160, 160]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] + 1.0).abs() < 1e-6);
    }
}
