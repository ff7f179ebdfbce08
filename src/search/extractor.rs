//! Embedding extraction with a lazily loaded, process-wide model.
//!
//! The model is loaded at most once: concurrent first callers await the same
//! in-flight load, and a failed load leaves the slot empty so the next call
//! tries again. Every external step (fetch, load, inference) is bounded by a
//! timeout.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::images::{self, DecodeError};
use crate::search::embeddings::{EmbeddingError, ImageEmbedder};
use crate::storage::StorageManager;

/// Where the bytes of an image come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Url(String),
    /// A file in upload storage.
    Stored(String),
    Path(PathBuf),
}

impl ImageSource {
    /// `http(s)://` locators are fetched, anything else is a local path.
    pub fn from_locator(locator: &str) -> Self {
        let lower = locator.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageSource::Url(locator.to_string())
        } else {
            ImageSource::Path(PathBuf::from(locator))
        }
    }

    /// Stable key for the embedding cache; raw bytes have none.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            ImageSource::Bytes(_) => None,
            ImageSource::Url(url) => Some(url.clone()),
            ImageSource::Stored(name) => Some(format!("upload:{name}")),
            ImageSource::Path(path) => Some(format!("file:{}", path.display())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to fetch image: {0}")]
    Fetch(String),

    #[error("{0} timed out after {1}s")]
    Timeout(&'static str, u64),

    #[error(transparent)]
    Model(#[from] EmbeddingError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum ModelState {
    NotLoaded,
    Loading,
    Loaded,
    Failed(String),
}

pub type ModelLoader =
    Arc<dyn Fn() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub model_name: String,
    /// Required model output size, if the store is already fixed to one.
    pub dimensions: Option<usize>,
    pub load_timeout: Duration,
    pub extraction_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_bytes: usize,
}

pub struct Extractor {
    loader: ModelLoader,
    model: OnceCell<Arc<dyn ImageEmbedder>>,
    state: Mutex<ModelState>,
    http: reqwest::Client,
    storage: Arc<dyn StorageManager>,
    options: ExtractorOptions,
}

impl Extractor {
    pub fn new(
        loader: ModelLoader,
        storage: Arc<dyn StorageManager>,
        options: ExtractorOptions,
    ) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
            state: Mutex::new(ModelState::NotLoaded),
            http: reqwest::Client::new(),
            storage,
            options,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.options.model_name
    }

    pub fn options(&self) -> &ExtractorOptions {
        &self.options
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn state(&self) -> ModelState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// The loaded model, loading it if needed.
    pub async fn model(&self) -> Result<Arc<dyn ImageEmbedder>, ExtractError> {
        self.model.get_or_try_init(|| self.load()).await.cloned()
    }

    /// Extract the embedding for `source`. Never retries.
    pub async fn extract(&self, source: &ImageSource) -> Result<Vec<f32>, ExtractError> {
        let bytes = self.read_source(source).await?;

        // cheap sniff before paying for a model load
        images::upload_extension(&bytes)?;

        let model = self.model().await?;
        let secs = self.options.extraction_timeout.as_secs();

        let handle = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, ExtractError> {
            images::decode_check(&bytes)?;
            Ok(model.embed(&bytes)?)
        });

        match tokio::time::timeout(self.options.extraction_timeout, handle).await {
            Err(_) => Err(ExtractError::Timeout("inference", secs)),
            Ok(Err(join_err)) => Err(EmbeddingError::EmbeddingFailed(join_err.to_string()).into()),
            Ok(Ok(result)) => result,
        }
    }

    async fn load(&self) -> Result<Arc<dyn ImageEmbedder>, ExtractError> {
        self.set_state(ModelState::Loading);
        log::info!("Loading image model '{}'", self.options.model_name);

        let loader = self.loader.clone();
        let secs = self.options.load_timeout.as_secs();
        let loaded = tokio::time::timeout(
            self.options.load_timeout,
            tokio::task::spawn_blocking(move || loader()),
        )
        .await;

        let result = match loaded {
            Err(_) => Err(ExtractError::Timeout("model load", secs)),
            Ok(Err(join_err)) => Err(EmbeddingError::InitFailed(join_err.to_string()).into()),
            Ok(Ok(model)) => model.map_err(ExtractError::from),
        }
        .and_then(|model| match self.options.dimensions {
            Some(expected) if expected != model.dimensions() => {
                Err(EmbeddingError::InitFailed(format!(
                    "model '{}' produces {}-dimensional vectors, store expects {}",
                    model.name(),
                    model.dimensions(),
                    expected
                ))
                .into())
            }
            _ => Ok(model),
        });

        match &result {
            Ok(model) => {
                log::info!(
                    "Image model '{}' loaded ({} dimensions)",
                    model.name(),
                    model.dimensions()
                );
                self.set_state(ModelState::Loaded);
            }
            Err(err) => {
                log::error!("Image model load failed: {err}");
                self.set_state(ModelState::Failed(err.to_string()));
            }
        }

        result
    }

    async fn read_source(&self, source: &ImageSource) -> Result<Vec<u8>, ExtractError> {
        match source {
            ImageSource::Bytes(bytes) => Ok(bytes.clone()),
            ImageSource::Url(url) => {
                fetch_remote(
                    &self.http,
                    url,
                    self.options.fetch_timeout,
                    self.options.max_bytes,
                )
                .await
            }
            ImageSource::Stored(name) => {
                let storage = self.storage.clone();
                let name = name.clone();
                tokio::task::spawn_blocking(move || storage.read(&name))
                    .await
                    .map_err(|e| ExtractError::Fetch(e.to_string()))?
                    .map_err(|e| ExtractError::Fetch(format!("stored image unavailable: {e}")))
            }
            ImageSource::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| ExtractError::Fetch(format!("{}: {e}", path.display()))),
        }
    }

    fn set_state(&self, state: ModelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Download an image over http(s), bounded by `timeout` and `max_bytes`.
pub async fn fetch_remote(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<Vec<u8>, ExtractError> {
    let parsed = url::Url::parse(url).map_err(|e| ExtractError::Fetch(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractError::Fetch(format!(
            "unsupported url scheme: {}",
            parsed.scheme()
        )));
    }

    let secs = timeout.as_secs();
    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ExtractError::Timeout("image fetch", secs)
        } else {
            ExtractError::Fetch(e.to_string())
        }
    };

    let response = client
        .get(parsed)
        .timeout(timeout)
        .send()
        .await
        .map_err(map_err)?
        .error_for_status()
        .map_err(map_err)?;

    if let Some(len) = response.content_length() {
        if len > max_bytes as u64 {
            return Err(ExtractError::Fetch(format!(
                "image is {len} bytes, limit is {max_bytes}"
            )));
        }
    }

    let bytes = response.bytes().await.map_err(map_err)?;
    if bytes.len() > max_bytes {
        return Err(ExtractError::Fetch(format!(
            "image is {} bytes, limit is {max_bytes}",
            bytes.len()
        )));
    }

    Ok(bytes.to_vec())
}
