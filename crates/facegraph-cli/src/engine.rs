//! Engine worker: owns the ONNX sessions and serves pipeline requests
//! from a dedicated OS thread over an async channel handle.
//!
//! Handlers stay free of model state; each request completes or fails
//! within one call, with the graph store as the only shared mutable
//! state.

use crate::config::Config;
use facegraph_core::align::AlignConfig;
use facegraph_core::detector::{DetectorConfig, FaceDetector};
use facegraph_core::embedder::{EmbeddingGenerator, OnnxEmbedder};
use facegraph_core::matcher;
use facegraph_core::normalize::NormalizeConfig;
use facegraph_core::pipeline::{FacePipeline, PipelineError};
use facegraph_core::types::AlignmentSource;
use facegraph_store::{GraphStore, IdentityAttrs, RankedMatch, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] facegraph_core::detector::DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] facegraph_core::embedder::EmbedderError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an identification request.
pub struct IdentifyResult {
    /// Best-match decision; -1 when no candidate met the threshold.
    pub match_id: i64,
    /// Ranked candidates regardless of threshold.
    pub candidates: Vec<RankedMatch>,
    /// Whether alignment used a detected face or the whole-image fallback.
    pub alignment: AlignmentSource,
}

/// Messages sent from command handlers to the engine thread.
enum EngineRequest {
    Enroll {
        attrs: IdentityAttrs,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<i64, EngineError>>,
    },
    Identify {
        image: Vec<u8>,
        top_k: usize,
        reply: oneshot::Sender<Result<IdentifyResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request enrollment: run the pipeline, persist the identity.
    pub async fn enroll(&self, attrs: IdentityAttrs, image: Vec<u8>) -> Result<i64, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { attrs, image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request identification: run the pipeline, rank against the index.
    pub async fn identify(&self, image: Vec<u8>, top_k: usize) -> Result<IdentifyResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify { image, top_k, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously (fail-fast), then enters a
/// request loop. The sessions live on this thread for the process
/// lifetime; they are constructed once and never mutated after.
pub fn spawn_engine(config: &Config, store: Arc<GraphStore>) -> Result<EngineHandle, EngineError> {
    let detector = FaceDetector::load(&config.detector_model_path(), DetectorConfig::default())?;
    tracing::info!(path = %config.detector_model_path(), "face detector loaded");

    let embedder = OnnxEmbedder::load(&config.embedder_model_path())?;
    tracing::info!(path = %config.embedder_model_path(), "embedding model loaded");

    let pipeline = FacePipeline::new(
        Box::new(detector),
        EmbeddingGenerator::new(Box::new(embedder), config.embedding_dim),
        NormalizeConfig::default(),
        AlignConfig::default(),
    );

    let threshold = config.similarity_threshold;
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegraph-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { attrs, image, reply } => {
                        let result = run_enroll(&store, &pipeline, &attrs, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Identify { image, top_k, reply } => {
                        let result = run_identify(&store, &pipeline, &image, threshold, top_k);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|_| EngineError::ChannelClosed)?;

    Ok(EngineHandle { tx })
}

/// Embed the image and persist identity + embedding atomically.
fn run_enroll(
    store: &GraphStore,
    pipeline: &FacePipeline,
    attrs: &IdentityAttrs,
    image: &[u8],
) -> Result<i64, EngineError> {
    let output = pipeline.process(image)?;

    if output.alignment == AlignmentSource::Fallback {
        tracing::warn!(
            first_name = %attrs.first_name,
            "enrolling from whole-image fallback; no face was located"
        );
    }

    let id = store.create_identity(attrs, &output.embedding)?;
    Ok(id)
}

/// Embed the image and rank it against every enrolled identity.
fn run_identify(
    store: &GraphStore,
    pipeline: &FacePipeline,
    image: &[u8],
    threshold: f32,
    top_k: usize,
) -> Result<IdentifyResult, EngineError> {
    let output = pipeline.process(image)?;

    let candidates = store.index().query(&output.embedding, top_k);
    let match_id = matcher::best_match(&candidates, threshold);
    let ranked = store.annotate(&candidates)?;

    tracing::debug!(
        match_id,
        candidates = ranked.len(),
        alignment = ?output.alignment,
        "identification complete"
    );

    Ok(IdentifyResult { match_id, candidates: ranked, alignment: output.alignment })
}
