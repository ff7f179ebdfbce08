//! Bulk indexing of catalog products into the vector store.
//!
//! Each product is handled independently on a bounded pool: a missing product
//! or an unreachable image is logged and counted, and the rest of the batch
//! carries on.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::catalog::Catalog;
use crate::search::cache::EmbeddingCache;
use crate::search::extractor::{ExtractError, Extractor, ImageSource};
use crate::search::record::EmbeddingRecord;
use crate::search::store::{StoreError, VectorStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexFailure {
    #[error("product {0} not found in catalog")]
    ProductNotFound(u64),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Indexer {
    catalog: Arc<dyn Catalog>,
    extractor: Arc<Extractor>,
    cache: Arc<EmbeddingCache>,
    store: Arc<dyn VectorStore>,
    parallelism: usize,
}

impl Indexer {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        extractor: Arc<Extractor>,
        cache: Arc<EmbeddingCache>,
        store: Arc<dyn VectorStore>,
        parallelism: usize,
    ) -> Self {
        Self {
            catalog,
            extractor,
            cache,
            store,
            parallelism: parallelism.max(1),
        }
    }

    /// Index `product_ids`, replacing any earlier record per product.
    pub async fn index_products(&self, product_ids: &[u64]) -> IndexReport {
        let permits = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();

        for &product_id in product_ids {
            let indexer = self.clone();
            let permits = permits.clone();
            set.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                (product_id, indexer.index_one(product_id).await)
            });
        }

        let mut report = IndexReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.indexed += 1,
                Ok((product_id, Err(err))) => {
                    log::warn!("failed to index product {product_id}: {err}");
                    report.failed += 1;
                }
                Err(join_err) => {
                    log::error!("indexing task panicked: {join_err}");
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "indexed {} products, {} failed",
            report.indexed,
            report.failed
        );
        report
    }

    async fn index_one(&self, product_id: u64) -> Result<(), IndexFailure> {
        let product = self
            .catalog
            .product(product_id)
            .ok_or(IndexFailure::ProductNotFound(product_id))?;

        let source = ImageSource::from_locator(&product.image);
        let vector = match source.cache_key() {
            Some(key) => {
                self.cache
                    .get_or_compute(&key, || self.extractor.extract(&source))
                    .await?
            }
            None => self.extractor.extract(&source).await?,
        };

        let record = EmbeddingRecord::product(product_id, vector, Some(product.snapshot()));
        self.store.insert(record)?;
        log::debug!("indexed product {product_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, Product};
    use crate::images::tests::solid_png;
    use crate::search::store::MemoryVectorStore;
    use crate::tests::support;

    struct Fixture {
        indexer: Indexer,
        store: Arc<MemoryVectorStore>,
        catalog: Arc<MemoryCatalog>,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let (storage, tmp) = support::temp_storage();
        let catalog = Arc::new(MemoryCatalog::new());
        let store = Arc::new(MemoryVectorStore::new(Some(3)));
        let extractor = Arc::new(Extractor::new(
            support::color_loader(3),
            storage,
            support::extractor_options(3),
        ));
        let indexer = Indexer::new(
            catalog.clone(),
            extractor,
            Arc::new(EmbeddingCache::new(16)),
            store.clone(),
            2,
        );
        Fixture {
            indexer,
            store,
            catalog,
            _tmp: tmp,
        }
    }

    fn product_with_image(dir: &std::path::Path, id: u64, rgb: [u8; 3], stock: i64) -> Product {
        let path = dir.join(format!("{id}.png"));
        std::fs::write(&path, solid_png(4, 4, rgb)).unwrap();
        Product {
            id,
            name: format!("product {id}"),
            price: 10.0 * id as f64,
            image: path.to_string_lossy().into_owned(),
            category: Some("shoes".to_string()),
            stock: Some(stock),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_counted() {
        let f = fixture();
        let images = tempfile::tempdir().unwrap();
        f.catalog.register(vec![
            product_with_image(images.path(), 1, [255, 0, 0], 3),
            product_with_image(images.path(), 2, [0, 255, 0], 0),
        ]);

        let report = f.indexer.index_products(&[1, 999, 2]).await;

        assert_eq!(report, IndexReport { indexed: 2, failed: 1 });
        assert!(f.store.get_by_product_id(1).is_some());
        assert!(f.store.get_by_product_id(2).is_some());
        assert!(f.store.get_by_product_id(999).is_none());
    }

    #[tokio::test]
    async fn test_reindexing_is_idempotent() {
        let f = fixture();
        let images = tempfile::tempdir().unwrap();
        f.catalog
            .register(vec![product_with_image(images.path(), 7, [0, 0, 255], 1)]);

        f.indexer.index_products(&[7]).await;
        let first = f.store.get_by_product_id(7).unwrap();
        f.indexer.index_products(&[7, 7]).await;

        assert_eq!(f.store.product_count(), 1);
        assert_eq!(f.store.all_product_records().len(), 1);
        assert_eq!(f.store.get_by_product_id(7).unwrap().vector, first.vector);
    }

    #[tokio::test]
    async fn test_metadata_is_snapshotted() {
        let f = fixture();
        let images = tempfile::tempdir().unwrap();
        f.catalog
            .register(vec![product_with_image(images.path(), 4, [9, 9, 9], 12)]);

        f.indexer.index_products(&[4]).await;

        let record = f.store.get_by_product_id(4).unwrap();
        let metadata = record.metadata.as_ref().unwrap();
        assert_eq!(metadata.name, "product 4");
        assert_eq!(metadata.stock, Some(12));
        assert_eq!(metadata.category.as_deref(), Some("shoes"));
    }

    #[tokio::test]
    async fn test_unreadable_image_fails_item() {
        let f = fixture();
        f.catalog.register(vec![Product {
            id: 5,
            name: "ghost".to_string(),
            price: 1.0,
            image: "/nonexistent/ghost.png".to_string(),
            category: None,
            stock: None,
        }]);

        let report = f.indexer.index_products(&[5]).await;
        assert_eq!(report, IndexReport { indexed: 0, failed: 1 });
        assert_eq!(f.store.product_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let f = fixture();
        assert_eq!(f.indexer.index_products(&[]).await, IndexReport::default());
    }
}
