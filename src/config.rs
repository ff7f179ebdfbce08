use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::search::{DEFAULT_DIMENSIONS, DEFAULT_MODEL, DEFAULT_TOP_K, MAX_TOP_K};
use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
const DEFAULT_CATALOG_FILE: &str = "products.json";

const DEFAULT_CACHE_SIZE: usize = 1024;
const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_WAIT_FOR_EMBEDDING_MS: u64 = 10_000;
const DEFAULT_IMAGE_TTL_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Configuration for embedding extraction and ranking
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Image model name (e.g., "resnet50", "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Vector length every record must have
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Server-side ceiling applied to every requested topK
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// LRU capacity of the embedding cache, 0 disables it
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,

    /// Timeout for downloading remote images
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Timeout for model download and load
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Concurrent products while indexing: "auto" or a positive integer
    #[serde(default = "default_index_parallelism")]
    pub index_parallelism: String,

    /// Keep product vectors in vectors.bin across restarts
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Load the model when the daemon starts instead of on first use
    #[serde(default = "default_true")]
    pub preload_model: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            default_top_k: DEFAULT_TOP_K,
            max_top_k: MAX_TOP_K,
            cache_size: DEFAULT_CACHE_SIZE,
            extraction_timeout_secs: DEFAULT_EXTRACTION_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            index_parallelism: default_index_parallelism(),
            persist: true,
            preload_model: true,
        }
    }
}

impl SearchConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    /// Resolved worker count for indexing.
    pub fn parallelism(&self) -> usize {
        match self.index_parallelism.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_bytes: usize,

    /// How long an upload waits for its embedding before answering `pending`
    #[serde(default = "default_wait_for_embedding_ms")]
    pub wait_for_embedding_ms: u64,

    /// Age after which uploaded images and their vectors are swept, 0 keeps them
    #[serde(default = "default_image_ttl_secs")]
    pub image_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            wait_for_embedding_ms: DEFAULT_WAIT_FOR_EMBEDDING_MS,
            image_ttl_secs: DEFAULT_IMAGE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Prefix for the `imageUrl` returned by uploads
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    /// Product catalog seed, relative to the base path
    #[serde(default = "default_catalog_file")]
    pub catalog_file: String,

    #[serde(skip_serializing, skip_deserializing)]
    pub base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            search: SearchConfig::default(),
            upload: UploadConfig::default(),
            catalog_file: default_catalog_file(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_top_k() -> usize {
    MAX_TOP_K
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_extraction_timeout_secs() -> u64 {
    DEFAULT_EXTRACTION_TIMEOUT_SECS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_index_parallelism() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_wait_for_embedding_ms() -> u64 {
    DEFAULT_WAIT_FOR_EMBEDDING_MS
}

fn default_image_ttl_secs() -> u64 {
    DEFAULT_IMAGE_TTL_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_public_url() -> String {
    DEFAULT_PUBLIC_URL.to_string()
}

fn default_catalog_file() -> String {
    DEFAULT_CATALOG_FILE.to_string()
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let search = &self.search;

        if search.max_top_k == 0 || search.max_top_k > 10_000 {
            bail!(
                "search.max_top_k must be between 1 and 10000, got {}",
                search.max_top_k
            );
        }

        if search.default_top_k == 0 || search.default_top_k > search.max_top_k {
            bail!(
                "search.default_top_k must be between 1 and search.max_top_k ({}), got {}",
                search.max_top_k,
                search.default_top_k
            );
        }

        if search.dimensions == 0 || search.dimensions > u16::MAX as usize {
            bail!(
                "search.dimensions must be between 1 and 65535, got {}",
                search.dimensions
            );
        }

        for (name, value) in [
            ("search.extraction_timeout_secs", search.extraction_timeout_secs),
            ("search.fetch_timeout_secs", search.fetch_timeout_secs),
            ("search.download_timeout_secs", search.download_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        // "auto" or positive integer
        if search.index_parallelism != "auto" {
            match search.index_parallelism.parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => bail!(
                    "search.index_parallelism must be 'auto' or a positive integer, got '{}'",
                    search.index_parallelism
                ),
            }
        }

        if self.upload.max_bytes == 0 {
            bail!("upload.max_bytes must be greater than 0");
        }

        if self.upload.sweep_interval_secs == 0 {
            bail!("upload.sweep_interval_secs must be greater than 0");
        }

        url::Url::parse(&self.public_url)
            .with_context(|| format!("public_url '{}' is not a valid url", self.public_url))?;

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to open {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;
        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.base_path.join("uploads")
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.base_path.join("vectors.bin")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.base_path.join(&self.catalog_file)
    }
}
