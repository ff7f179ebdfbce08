use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::app::service::AppService;
use crate::catalog::MemoryCatalog;
use crate::config::Config;
use crate::search::embeddings::{FastembedImageModel, ImageEmbedder};
use crate::search::extractor::{Extractor, ExtractorOptions, ModelLoader};
use crate::search::snapshot::VectorSnapshot;
use crate::search::store::MemoryVectorStore;
use crate::search::EmbeddingCache;
use crate::storage::{self, StorageManager};

/// Wires config, storage, the model loader and the store into an [`AppService`].
pub struct AppFactory {
    config: Config,
    loader: Option<ModelLoader>,
}

impl AppFactory {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            loader: None,
        }
    }

    /// Load config from the base path (env override or home directory).
    pub fn from_env() -> Result<Self> {
        let paths = Self::get_paths()?;
        let config = Config::load_with(&paths.base_path)?;
        Ok(Self::new(config))
    }

    /// Replace the fastembed model, e.g. with a stand-in for tests.
    pub fn with_loader(mut self, loader: ModelLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn build(self) -> Result<AppService> {
        let config = self.config;

        let uploads: Arc<dyn StorageManager> = Arc::new(
            storage::BackendLocal::new(config.uploads_path())
                .context("Failed to create uploads directory")?,
        );

        let loader = self
            .loader
            .unwrap_or_else(|| fastembed_loader(&config.search.model, config.base_path.clone()));

        let search = &config.search;
        let options = ExtractorOptions {
            model_name: search.model.clone(),
            dimensions: Some(search.dimensions),
            load_timeout: Duration::from_secs(search.download_timeout_secs),
            extraction_timeout: search.extraction_timeout(),
            fetch_timeout: Duration::from_secs(search.fetch_timeout_secs),
            max_bytes: config.upload.max_bytes,
        };

        let extractor = Arc::new(Extractor::new(loader, uploads.clone(), options));
        let store = Arc::new(MemoryVectorStore::new(Some(search.dimensions)));
        let cache = Arc::new(EmbeddingCache::new(search.cache_size));
        if !cache.is_enabled() {
            log::info!("embedding cache disabled");
        }
        let catalog = Arc::new(MemoryCatalog::load_json(&config.catalog_path())?);

        let snapshot = search
            .persist
            .then(|| VectorSnapshot::new(config.vectors_path()));

        Ok(AppService::new(
            Arc::new(config),
            store,
            extractor,
            cache,
            catalog,
            uploads,
            snapshot,
        ))
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        // Ensure base directory exists
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths { base_path })
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("PIXMATCH_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/pixmatch"))
    }
}

fn fastembed_loader(model_name: &str, base_path: PathBuf) -> ModelLoader {
    let model_name = model_name.to_string();
    Arc::new(move || {
        FastembedImageModel::new(&model_name, base_path.clone())
            .map(|model| Arc::new(model) as Arc<dyn ImageEmbedder>)
    })
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}
