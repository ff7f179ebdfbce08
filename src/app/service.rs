//! Query facade: upload intake, readiness, search, indexing and upkeep.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::errors::{self, AppError};
use crate::app::tasks::{ImageStatus, ImageTasks};
use crate::catalog::{Catalog, MemoryCatalog, Product};
use crate::config::Config;
use crate::eid::{self, Eid};
use crate::images;
use crate::search::embeddings::model_id_hash;
use crate::search::extractor::{self, Extractor, ImageSource, ModelState};
use crate::search::indexer::{IndexReport, Indexer};
use crate::search::ranker::{self, ScoredProduct, SearchFilters};
use crate::search::record::EmbeddingRecord;
use crate::search::snapshot::{SnapshotError, VectorSnapshot};
use crate::search::store::VectorStore;
use crate::search::EmbeddingCache;
use crate::storage::StorageManager;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub top_k: Option<usize>,
    pub filters: SearchFilters,
    /// How long to wait for a pending extraction before answering not-ready.
    pub wait: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub image_id: String,
    pub image_url: String,
    pub size: usize,
    pub uploaded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: ImageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub indexed_products: usize,
    pub vector_dimensions: usize,
    pub model: String,
    pub model_state: ModelState,
    pub cached_embeddings: Option<usize>,
    pub pending_images: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppService {
    config: Arc<Config>,
    store: Arc<dyn VectorStore>,
    extractor: Arc<Extractor>,
    cache: Arc<EmbeddingCache>,
    catalog: Arc<MemoryCatalog>,
    indexer: Indexer,
    uploads: Arc<dyn StorageManager>,
    tasks: Arc<ImageTasks>,
    snapshot: Option<Arc<VectorSnapshot>>,
    /// Serializes snapshot writes.
    snapshot_lock: Arc<tokio::sync::Mutex<()>>,
    last_updated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl AppService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn VectorStore>,
        extractor: Arc<Extractor>,
        cache: Arc<EmbeddingCache>,
        catalog: Arc<MemoryCatalog>,
        uploads: Arc<dyn StorageManager>,
        snapshot: Option<VectorSnapshot>,
    ) -> Self {
        let indexer = Indexer::new(
            catalog.clone(),
            extractor.clone(),
            cache.clone(),
            store.clone(),
            config.search.parallelism(),
        );

        Self {
            config,
            store,
            extractor,
            cache,
            catalog,
            indexer,
            uploads,
            tasks: Arc::new(ImageTasks::new()),
            snapshot: snapshot.map(Arc::new),
            snapshot_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_updated: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn extractor(&self) -> &Arc<Extractor> {
        &self.extractor
    }

    pub fn tasks(&self) -> &ImageTasks {
        &self.tasks
    }

    // ---- intake ----

    /// Persist an uploaded image and start extracting its embedding.
    ///
    /// Waits up to `upload.wait_for_embedding_ms` so most callers get a
    /// `ready` receipt and can query immediately.
    pub async fn upload_bytes(&self, bytes: Vec<u8>) -> Result<UploadReceipt, AppError> {
        let limit = self.config.upload.max_bytes;
        if bytes.len() > limit {
            return Err(AppError::PayloadTooLarge { limit });
        }

        let ext = images::upload_extension(&bytes)?;
        let bytes = Arc::new(bytes);

        let image_id = Eid::new().to_string();
        let file_name = format!("{image_id}.{ext}");
        {
            let bytes = bytes.clone();
            let uploads = self.uploads.clone();
            let file_name = file_name.clone();
            tokio::task::spawn_blocking(move || -> Result<(), AppError> {
                images::decode_check(&bytes)?;
                uploads.write(&file_name, &bytes)?;
                Ok(())
            })
            .await
            .map_err(|e| AppError::Other(e.into()))??;
        }

        self.tasks.start(&image_id);
        tokio::spawn({
            let service = self.clone();
            let image_id = image_id.clone();
            let file_name = file_name.clone();
            let bytes = bytes.clone();
            async move { service.extract_upload(&image_id, &file_name, &bytes).await }
        });

        let wait = Duration::from_millis(self.config.upload.wait_for_embedding_ms);
        let status = self
            .tasks
            .wait(&image_id, wait)
            .await
            .unwrap_or(ImageStatus::Pending);

        log::info!("uploaded image {image_id} ({} bytes)", bytes.len());

        Ok(UploadReceipt {
            image_url: format!(
                "{}/uploads/{file_name}",
                self.config.public_url.trim_end_matches('/')
            ),
            image_id,
            size: bytes.len(),
            uploaded_at: Utc::now(),
            status,
        })
    }

    /// Download a remote image and upload it.
    pub async fn upload_url(&self, url: &str) -> Result<UploadReceipt, AppError> {
        let bytes = extractor::fetch_remote(
            self.extractor.http(),
            url,
            Duration::from_secs(self.config.search.fetch_timeout_secs),
            self.config.upload.max_bytes,
        )
        .await?;

        self.upload_bytes(bytes).await
    }

    async fn extract_upload(&self, image_id: &str, file_name: &str, bytes: &[u8]) {
        let key = ImageSource::Stored(file_name.to_string())
            .cache_key()
            .unwrap_or_else(|| file_name.to_string());
        let source = ImageSource::Bytes(bytes.to_vec());

        let result = self
            .cache
            .get_or_compute(&key, || self.extractor.extract(&source))
            .await
            .map_err(AppError::from)
            .and_then(|vector| self.store_upload_vector(image_id, vector));

        match result {
            Ok(()) => self.tasks.finish(image_id, ImageStatus::Ready),
            Err(err) => {
                log::warn!("background extraction for image {image_id} failed: {err}");
                self.tasks.finish(
                    image_id,
                    ImageStatus::Failed {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    /// Insert an upload's vector unless the image was deleted meanwhile.
    fn store_upload_vector(&self, image_id: &str, vector: Vec<f32>) -> Result<(), AppError> {
        if self.tasks.status(image_id).is_none() {
            return Ok(());
        }
        let id = self.store.insert(EmbeddingRecord::image(image_id, vector))?;

        // delete_image forgets the task before dropping records, so a
        // delete that ran after the check above is visible here
        if self.tasks.status(image_id).is_none() {
            self.store.delete(&id);
        }
        Ok(())
    }

    pub fn image_status(&self, image_id: &str) -> Result<ImageStatus, AppError> {
        validate_image_id(image_id)?;

        if self.store.get_by_image_id(image_id).is_some() {
            return Ok(ImageStatus::Ready);
        }

        match self.tasks.status(image_id) {
            Some(ImageStatus::Ready) | None => {}
            Some(status) => return Ok(status),
        }

        // on-disk upload without a vector is extracted on first query
        match self.uploads.find_by_stem(image_id) {
            Some(_) => Ok(ImageStatus::Pending),
            None => Err(AppError::NotFound(format!("image {image_id}"))),
        }
    }

    // ---- search ----

    /// Rank catalog products against a previously uploaded image.
    pub async fn search(
        &self,
        image_id: &str,
        request: SearchRequest,
    ) -> Result<Vec<ScoredProduct>, AppError> {
        validate_image_id(image_id)?;
        request.filters.validate().map_err(AppError::Validation)?;

        let vector = self.resolve_image_vector(image_id, request.wait).await?;
        self.rank(&vector, &request)
    }

    /// Upload then search, waiting as long as an extraction may take.
    pub async fn search_by_image_bytes(
        &self,
        bytes: Vec<u8>,
        request: SearchRequest,
    ) -> Result<(UploadReceipt, Vec<ScoredProduct>), AppError> {
        request.filters.validate().map_err(AppError::Validation)?;
        let receipt = self.upload_bytes(bytes).await?;
        let results = self.search_uploaded(&receipt.image_id, request).await?;
        Ok((receipt, results))
    }

    pub async fn search_by_image_url(
        &self,
        url: &str,
        request: SearchRequest,
    ) -> Result<(UploadReceipt, Vec<ScoredProduct>), AppError> {
        request.filters.validate().map_err(AppError::Validation)?;
        let receipt = self.upload_url(url).await?;
        let results = self.search_uploaded(&receipt.image_id, request).await?;
        Ok((receipt, results))
    }

    /// Rank an arbitrary image without keeping it as an upload.
    pub async fn search_source(
        &self,
        source: ImageSource,
        request: SearchRequest,
    ) -> Result<Vec<ScoredProduct>, AppError> {
        request.filters.validate().map_err(AppError::Validation)?;

        let vector = match source.cache_key() {
            Some(key) => {
                self.cache
                    .get_or_compute(&key, || self.extractor.extract(&source))
                    .await?
            }
            None => self.extractor.extract(&source).await?,
        };

        self.rank(&vector, &request)
    }

    async fn search_uploaded(
        &self,
        image_id: &str,
        mut request: SearchRequest,
    ) -> Result<Vec<ScoredProduct>, AppError> {
        request.wait = request.wait.max(self.config.search.extraction_timeout());
        self.search(image_id, request).await
    }

    async fn resolve_image_vector(&self, image_id: &str, wait: Duration) -> Result<Vec<f32>, AppError> {
        if let Some(record) = self.store.get_by_image_id(image_id) {
            return Ok(record.vector.clone());
        }

        match self.tasks.status(image_id) {
            Some(ImageStatus::Pending) => {
                let wait = wait.min(self.config.search.extraction_timeout());
                match self.tasks.wait(image_id, wait).await {
                    Some(ImageStatus::Ready) => {
                        if let Some(record) = self.store.get_by_image_id(image_id) {
                            return Ok(record.vector.clone());
                        }
                    }
                    Some(ImageStatus::Failed { error }) => return Err(AppError::Extraction(error)),
                    Some(ImageStatus::Pending) => {
                        return Err(AppError::NotReady(image_id.to_string()))
                    }
                    // deleted while waiting
                    None => return Err(AppError::NotFound(format!("image {image_id}"))),
                }
            }
            Some(ImageStatus::Failed { error }) => return Err(AppError::Extraction(error)),
            Some(ImageStatus::Ready) | None => {}
        }

        let Some(file_name) = self.uploads.find_by_stem(image_id) else {
            return Err(AppError::NotFound(format!("image {image_id}")));
        };

        log::debug!("extracting image {image_id} on demand");
        let source = ImageSource::Stored(file_name);
        let vector = match source.cache_key() {
            Some(key) => {
                self.cache
                    .get_or_compute(&key, || self.extractor.extract(&source))
                    .await?
            }
            None => self.extractor.extract(&source).await?,
        };

        self.store
            .insert(EmbeddingRecord::image(image_id, vector.clone()))?;
        Ok(vector)
    }

    fn rank(&self, vector: &[f32], request: &SearchRequest) -> Result<Vec<ScoredProduct>, AppError> {
        let search = &self.config.search;
        let top_k = ranker::clamp_top_k(request.top_k, search.default_top_k, search.max_top_k);
        let candidates = self.store.all_product_records();

        Ok(ranker::rank(vector, &candidates, &request.filters, top_k)?)
    }

    // ---- catalog and index ----

    /// Add or overwrite catalog products, returning how many were given.
    pub fn register_products(&self, products: Vec<Product>) -> usize {
        self.catalog.register(products)
    }

    pub fn catalog_len(&self) -> usize {
        self.catalog.len()
    }

    pub async fn index_products(&self, product_ids: &[u64]) -> IndexReport {
        let report = self.indexer.index_products(product_ids).await;
        if report.indexed > 0 {
            self.touch();
            self.persist().await;
        }
        report
    }

    pub async fn index_all(&self) -> IndexReport {
        let ids = self.catalog.product_ids();
        self.index_products(&ids).await
    }

    pub fn product_embedding(&self, product_id: u64) -> Result<Arc<EmbeddingRecord>, AppError> {
        self.store
            .get_by_product_id(product_id)
            .ok_or_else(|| AppError::NotFound(format!("embedding for product {product_id}")))
    }

    pub async fn unindex_product(&self, product_id: u64) -> Result<(), AppError> {
        let record = self.product_embedding(product_id)?;
        self.store.delete(&record.id);
        log::info!("unindexed product {product_id}");

        self.touch();
        self.persist().await;
        Ok(())
    }

    // ---- image lifecycle ----

    /// Remove every trace of an uploaded image. Deleting twice is not an error.
    pub async fn delete_image(&self, image_id: &str) -> Result<bool, AppError> {
        validate_image_id(image_id)?;

        let mut existed = self.tasks.forget(image_id);
        while let Some(record) = self.store.get_by_image_id(image_id) {
            self.store.delete(&record.id);
            existed = true;
        }

        while let Some(file_name) = self.uploads.find_by_stem(image_id) {
            match self.uploads.delete(&file_name) {
                Ok(()) => existed = true,
                // removed by a concurrent delete or the sweep
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(key) = ImageSource::Stored(file_name).cache_key() {
                self.cache.evict(&key).await;
            }
        }

        if existed {
            log::info!("deleted image {image_id}");
        }
        Ok(existed)
    }

    /// Drop uploaded images older than `upload.image_ttl_secs`.
    ///
    /// Returns how many distinct images were removed.
    pub async fn sweep_expired_images(&self) -> usize {
        let ttl_secs = self.config.upload.image_ttl_secs;
        if ttl_secs == 0 {
            return 0;
        }
        let ttl = Duration::from_secs(ttl_secs);
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs as i64);

        let mut removed: BTreeSet<String> = BTreeSet::new();

        for record in self.store.purge_images_before(cutoff) {
            if let Some(image_id) = record.owner.image_id() {
                removed.insert(image_id.to_string());
            }
        }
        removed.extend(self.tasks.sweep(ttl));

        let cutoff_ms = cutoff.timestamp_millis().max(0) as u64;
        for file_name in self.uploads.list() {
            let stem = file_name.split('.').next().unwrap_or_default();
            let Ok(ulid) = rusty_ulid::Ulid::from_str(stem) else {
                continue;
            };
            if ulid.timestamp() >= cutoff_ms {
                continue;
            }
            if let Err(e) = self.uploads.delete(&file_name) {
                log::warn!("failed to remove expired upload {file_name}: {e}");
                continue;
            }
            if let Some(key) = ImageSource::Stored(file_name.clone()).cache_key() {
                self.cache.evict(&key).await;
            }
            removed.insert(stem.to_string());
        }

        if !removed.is_empty() {
            log::info!("swept {} expired images", removed.len());
        }
        removed.len()
    }

    // ---- persistence ----

    /// Write product vectors to disk. A no-op when persistence is off.
    pub async fn save_snapshot(&self) -> Result<usize, AppError> {
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(0);
        };
        let _guard = self.snapshot_lock.lock().await;

        let records = self.store.all_product_records();
        let model_id = model_id_hash(&self.config.search.model);
        let dimensions = self.config.search.dimensions;

        let written = tokio::task::spawn_blocking(move || {
            snapshot.save(&records, &model_id, dimensions)
        })
        .await
        .map_err(|e| AppError::Other(e.into()))??;

        log::info!("saved {written} product vectors");
        Ok(written)
    }

    /// Load product vectors saved by an earlier run.
    ///
    /// A snapshot written by a different model or vector size is ignored.
    pub async fn load_snapshot(&self) -> Result<usize, AppError> {
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(0);
        };
        if !snapshot.exists() {
            log::info!("No existing vectors, starting fresh");
            return Ok(0);
        }

        let model_id = model_id_hash(&self.config.search.model);
        let dimensions = self.config.search.dimensions;
        let loaded = tokio::task::spawn_blocking(move || snapshot.load(&model_id, dimensions))
            .await
            .map_err(|e| AppError::Other(e.into()))?;

        let records = match loaded {
            Ok(records) => records,
            Err(SnapshotError::ModelMismatch) => {
                log::warn!("Model changed, discarding saved vectors");
                return Ok(0);
            }
            Err(SnapshotError::DimensionMismatch { expected, got }) => {
                log::warn!(
                    "Dimension mismatch (expected {expected}, got {got}), discarding saved vectors"
                );
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        let mut newest: Option<DateTime<Utc>> = None;
        for record in records {
            let created_at = record.created_at;
            match self.store.insert(record) {
                Ok(_) => {
                    count += 1;
                    newest = newest.max(Some(created_at));
                }
                Err(e) => log::warn!("skipping saved vector: {e}"),
            }
        }

        if newest.is_some() {
            *self.last_updated.write().unwrap_or_else(PoisonError::into_inner) = newest;
        }
        log::info!("Loaded {count} vectors from storage");
        Ok(count)
    }

    async fn persist(&self) {
        if let Err(e) = self.save_snapshot().await {
            log::error!("failed to save vectors: {e}");
        }
    }

    fn touch(&self) {
        *self.last_updated.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    // ---- health ----

    /// Load the model ahead of the first request.
    pub async fn warm_up(&self) -> Result<(), AppError> {
        self.extractor.model().await.map_err(AppError::from)?;
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        let model_state = match self.extractor.state() {
            ModelState::Failed(_) => ModelState::Failed(errors::MODEL_UNAVAILABLE.to_string()),
            state => state,
        };
        let status = if self.extractor.is_loaded() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            indexed_products: self.store.product_count(),
            vector_dimensions: self
                .store
                .dimensions()
                .unwrap_or(self.config.search.dimensions),
            model: self.extractor.model_name().to_string(),
            model_state,
            cached_embeddings: self.cache.try_len(),
            pending_images: self.tasks.pending(),
            last_updated: *self.last_updated.read().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

fn validate_image_id(image_id: &str) -> Result<(), AppError> {
    if image_id.is_empty() {
        return Err(AppError::validation("imageId is required"));
    }
    if !eid::is_valid_id(image_id) {
        return Err(AppError::validation(format!("invalid imageId: {image_id:?}")));
    }
    Ok(())
}
