//! Image embedding model wrapper for fastembed.
//!
//! Provides a high-level interface for generating image embeddings:
//! - Model download into a configurable cache directory
//! - Dimension probing at load time
//! - A small trait so tests and alternative backends can stand in for the model

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use std::path::PathBuf;
use std::sync::Mutex;

/// Anything that turns encoded image bytes into a fixed-length vector.
pub trait ImageEmbedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Deterministic for a given input.
    fn embed(&self, image: &[u8]) -> Result<Vec<f32>, EmbeddingError>;
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed requires &mut self.
pub struct FastembedImageModel {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastembedImageModel {
    /// Load (downloading on first use) the named model.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (model_enum, dimensions) = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        let model = ImageEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl ImageEmbedder for FastembedImageModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, image: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&[image], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;

        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model returned {} values, expected {}",
                embedding.len(),
                self.dimensions
            )));
        }

        Ok(embedding)
    }
}

/// Compute SHA256 hash of the model name for snapshot identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.to_lowercase().as_bytes());
    hasher.finalize().into()
}

/// Parse model name string to the fastembed enum and its output size.
pub fn parse_model_name(name: &str) -> Result<(ImageEmbeddingModel, usize), EmbeddingError> {
    match name.to_lowercase().as_str() {
        "resnet50" | "resnet-50" => Ok((ImageEmbeddingModel::Resnet50, 2048)),
        "clip-vit-b-32" | "clipvitb32" => Ok((ImageEmbeddingModel::ClipVitB32, 512)),
        "unicom-vit-b-16" | "unicomvitb16" => Ok((ImageEmbeddingModel::UnicomVitB16, 768)),
        "unicom-vit-b-32" | "unicomvitb32" => Ok((ImageEmbeddingModel::UnicomVitB32, 512)),
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
            Ok((ImageEmbeddingModel::NomicEmbedVisionV15, 768))
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: resnet50, clip-vit-b-32, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
            name
        ))),
    }
}
