//! Pipeline composition: raw bytes → normalized image → located face →
//! aligned tile → unit-normalized embedding.
//!
//! Detection failures (including detector errors) are absorbed into the
//! whole-image fallback and never surface past alignment. Decode and
//! embedding failures propagate as explicit results.

use crate::align::{align_face, AlignConfig};
use crate::detector::LocateFaces;
use crate::embedder::{EmbedderError, EmbeddingGenerator};
use crate::normalize::{normalize_image, ImageDecodeError, NormalizeConfig};
use crate::types::{AlignmentSource, BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image decode: {0}")]
    ImageDecode(#[from] ImageDecodeError),
    #[error("embedding generation: {0}")]
    EmbeddingGeneration(#[from] EmbedderError),
}

/// Result of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub embedding: Embedding,
    /// Which alignment path ran; `Fallback` means no face was located.
    pub alignment: AlignmentSource,
    /// The located box, when detection succeeded.
    pub face: Option<BoundingBox>,
}

/// The face-identification pipeline.
pub struct FacePipeline {
    locator: Box<dyn LocateFaces>,
    generator: EmbeddingGenerator,
    normalize_config: NormalizeConfig,
    align_config: AlignConfig,
}

impl FacePipeline {
    pub fn new(
        locator: Box<dyn LocateFaces>,
        generator: EmbeddingGenerator,
        normalize_config: NormalizeConfig,
        align_config: AlignConfig,
    ) -> Self {
        Self { locator, generator, normalize_config, align_config }
    }

    /// Run the full pipeline on one image's bytes.
    ///
    /// Every decodable image yields an embedding: when no face is located
    /// (or the detector itself fails) the fallback tile is embedded and
    /// the output is flagged `Fallback`.
    pub fn process(&self, bytes: &[u8]) -> Result<PipelineOutput, PipelineError> {
        let image = normalize_image(bytes, &self.normalize_config)?;

        let face = match self.locator.locate(&image) {
            Ok(face) => face,
            Err(err) => {
                tracing::warn!(error = %err, "face detection failed; using whole-image fallback");
                None
            }
        };

        let aligned = align_face(&image, face.as_ref(), &self.align_config);
        let embedding = self.generator.generate(&aligned.tile)?;

        tracing::debug!(
            alignment = ?aligned.source,
            dimension = embedding.dimension(),
            "pipeline produced embedding"
        );

        Ok(PipelineOutput { embedding, alignment: aligned.source, face })
    }
}
