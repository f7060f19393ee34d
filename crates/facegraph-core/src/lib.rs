//! facegraph-core — Face identification pipeline.
//!
//! Turns an arbitrary photo into a unit-normalized embedding via a
//! normalize → detect → align → embed chain, with cascading fallbacks so
//! that every decodable image yields an embedding. Detection uses SCRFD
//! and embedding extraction a FaceNet-style model, both running via ONNX
//! Runtime for CPU inference.

pub mod align;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod types;

pub use align::{align_face, AlignConfig};
pub use detector::{FaceDetector, LocateFaces};
pub use embedder::{EmbeddingGenerator, EmbeddingModel, OnnxEmbedder};
pub use pipeline::{FacePipeline, PipelineOutput};
pub use types::{AlignmentSource, BoundingBox, Embedding, MatchCandidate, NO_MATCH_ID};
