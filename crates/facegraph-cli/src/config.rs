use std::path::PathBuf;

/// Service configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum similarity score for a positive match.
    pub similarity_threshold: f32,
    /// Candidates returned in ranked mode.
    pub top_k: usize,
    /// Embedding dimensionality of the configured model.
    pub embedding_dim: usize,
}

impl Config {
    /// Load configuration from `FACEGRAPH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegraph");

        let model_dir = std::env::var("FACEGRAPH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("FACEGRAPH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("graph.db"));

        Self {
            model_dir,
            db_path,
            similarity_threshold: env_f32("FACEGRAPH_SIMILARITY_THRESHOLD", 0.6),
            top_k: env_usize("FACEGRAPH_TOP_K", 5),
            embedding_dim: env_usize("FACEGRAPH_EMBEDDING_DIM", 512),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("facenet_vggface2.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
