//! Vector store for embedding records.
//!
//! The [`VectorStore`] trait is the seam for swapping the in-memory table
//! for a persistent or ANN-backed implementation without touching the
//! ranker, the indexer or the service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::eid::Eid;
use crate::search::record::{EmbeddingRecord, RecordOwner};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector contains NaN or infinite values")]
    NonFinite,
}

pub trait VectorStore: Send + Sync {
    /// Fixed vector length, once known.
    fn dimensions(&self) -> Option<usize>;

    /// Store a record, assigning an id if it has none.
    ///
    /// A product record replaces any earlier record for the same product.
    fn insert(&self, record: EmbeddingRecord) -> Result<Eid, StoreError>;

    fn get(&self, id: &Eid) -> Option<Arc<EmbeddingRecord>>;

    fn get_by_product_id(&self, product_id: u64) -> Option<Arc<EmbeddingRecord>>;

    /// Newest record for an uploaded image.
    fn get_by_image_id(&self, image_id: &str) -> Option<Arc<EmbeddingRecord>>;

    fn delete(&self, id: &Eid) -> bool;

    /// Every product record, ordered by product id.
    fn all_product_records(&self) -> Vec<Arc<EmbeddingRecord>>;

    /// Number of distinct indexed products.
    fn product_count(&self) -> usize;

    /// Remove image records created before `cutoff`, returning them.
    fn purge_images_before(&self, cutoff: DateTime<Utc>) -> Vec<Arc<EmbeddingRecord>>;
}

#[derive(Default)]
struct Tables {
    records: HashMap<Eid, Arc<EmbeddingRecord>>,
    products: BTreeMap<u64, Eid>,
    /// Oldest first.
    images: HashMap<String, Vec<Eid>>,
    dimensions: Option<usize>,
}

impl Tables {
    fn unlink(&mut self, record: &EmbeddingRecord) {
        match &record.owner {
            RecordOwner::Product { product_id } => {
                if self.products.get(product_id) == Some(&record.id) {
                    self.products.remove(product_id);
                }
            }
            RecordOwner::Image { image_id } => {
                if let Some(ids) = self.images.get_mut(image_id) {
                    ids.retain(|id| id != &record.id);
                    if ids.is_empty() {
                        self.images.remove(image_id);
                    }
                }
            }
        }
    }
}

/// In-memory store. All tables sit behind one lock so a replace-by-product
/// is never observable half done.
pub struct MemoryVectorStore {
    tables: RwLock<Tables>,
}

impl MemoryVectorStore {
    /// `dimensions` of `None` locks the length in on the first insert.
    pub fn new(dimensions: Option<usize>) -> Self {
        Self {
            tables: RwLock::new(Tables {
                dimensions,
                ..Default::default()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Writers only ever swap whole entries, so a poisoned lock still guards
    // consistent tables.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VectorStore for MemoryVectorStore {
    fn dimensions(&self) -> Option<usize> {
        self.read().dimensions
    }

    fn insert(&self, mut record: EmbeddingRecord) -> Result<Eid, StoreError> {
        if record.vector.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::NonFinite);
        }

        if record.id.is_unassigned() {
            record.id = Eid::new();
        }
        let id = record.id.clone();

        let mut tables = self.write();

        match tables.dimensions {
            Some(expected) if expected != record.vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    got: record.vector.len(),
                });
            }
            Some(_) => {}
            None => tables.dimensions = Some(record.vector.len()),
        }

        // a reused id replaces the old record wholesale
        if let Some(previous) = tables.records.remove(&id) {
            tables.unlink(&previous);
        }

        match &record.owner {
            RecordOwner::Product { product_id } => {
                if let Some(previous_id) = tables.products.insert(*product_id, id.clone()) {
                    tables.records.remove(&previous_id);
                }
            }
            RecordOwner::Image { image_id } => {
                tables
                    .images
                    .entry(image_id.clone())
                    .or_default()
                    .push(id.clone());
            }
        }

        tables.records.insert(id.clone(), Arc::new(record));

        Ok(id)
    }

    fn get(&self, id: &Eid) -> Option<Arc<EmbeddingRecord>> {
        self.read().records.get(id).cloned()
    }

    fn get_by_product_id(&self, product_id: u64) -> Option<Arc<EmbeddingRecord>> {
        let tables = self.read();
        tables
            .products
            .get(&product_id)
            .and_then(|id| tables.records.get(id))
            .cloned()
    }

    fn get_by_image_id(&self, image_id: &str) -> Option<Arc<EmbeddingRecord>> {
        let tables = self.read();
        tables
            .images
            .get(image_id)
            .and_then(|ids| ids.last())
            .and_then(|id| tables.records.get(id))
            .cloned()
    }

    fn delete(&self, id: &Eid) -> bool {
        let mut tables = self.write();
        match tables.records.remove(id) {
            Some(record) => {
                tables.unlink(&record);
                true
            }
            None => false,
        }
    }

    fn all_product_records(&self) -> Vec<Arc<EmbeddingRecord>> {
        let tables = self.read();
        tables
            .products
            .values()
            .filter_map(|id| tables.records.get(id))
            .cloned()
            .collect()
    }

    fn product_count(&self) -> usize {
        self.read().products.len()
    }

    fn purge_images_before(&self, cutoff: DateTime<Utc>) -> Vec<Arc<EmbeddingRecord>> {
        let mut tables = self.write();

        let expired: Vec<Eid> = tables
            .records
            .values()
            .filter(|r| r.owner.image_id().is_some() && r.created_at < cutoff)
            .map(|r| r.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                let record = tables.records.remove(id)?;
                tables.unlink(&record);
                Some(record)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::record::ProductSnapshot;

    fn product(id: u64, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord::product(
            id,
            vector,
            Some(ProductSnapshot {
                name: format!("product {id}"),
                price: 10.0,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_insert_assigns_id_and_get() {
        let store = MemoryVectorStore::new(Some(3));
        let id = store.insert(product(1, vec![1.0, 0.0, 0.0])).unwrap();

        assert!(!id.is_unassigned());
        let record = store.get(&id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.owner.product_id(), Some(1));
        assert_eq!(store.get_by_product_id(1).unwrap().id, id);
        assert_eq!(store.product_count(), 1);
    }

    #[test]
    fn test_reindex_replaces_product_record() {
        let store = MemoryVectorStore::new(Some(3));
        let first = store.insert(product(1, vec![1.0, 0.0, 0.0])).unwrap();
        let second = store.insert(product(1, vec![0.0, 1.0, 0.0])).unwrap();

        assert_ne!(first, second);
        assert!(store.get(&first).is_none());
        assert_eq!(store.product_count(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.all_product_records().len(), 1);
        assert_eq!(
            store.get_by_product_id(1).unwrap().vector,
            vec![0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = MemoryVectorStore::new(Some(2048));
        store.insert(product(1, vec![0.5; 2048])).unwrap();

        let result = store.insert(product(2, vec![0.5; 10]));
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch {
                expected: 2048,
                got: 10
            })
        ));
        assert_eq!(store.product_count(), 1);
    }

    #[test]
    fn test_first_insert_fixes_dimensions() {
        let store = MemoryVectorStore::new(None);
        assert_eq!(store.dimensions(), None);

        store.insert(EmbeddingRecord::image("a", vec![1.0, 2.0])).unwrap();
        assert_eq!(store.dimensions(), Some(2));

        let result = store.insert(product(1, vec![1.0, 2.0, 3.0]));
        assert!(matches!(result, Err(StoreError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_non_finite_rejected() {
        let store = MemoryVectorStore::new(Some(2));
        let result = store.insert(product(1, vec![f32::NAN, 1.0]));
        assert!(matches!(result, Err(StoreError::NonFinite)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_product_clears_secondary_index() {
        let store = MemoryVectorStore::new(Some(2));
        let id = store.insert(product(5, vec![1.0, 1.0])).unwrap();

        assert!(store.delete(&id));
        assert!(!store.delete(&id));
        assert!(store.get_by_product_id(5).is_none());
        assert_eq!(store.product_count(), 0);
    }

    #[test]
    fn test_all_product_records_skips_images_and_orders_by_product() {
        let store = MemoryVectorStore::new(Some(2));
        store.insert(product(9, vec![1.0, 0.0])).unwrap();
        store.insert(EmbeddingRecord::image("img", vec![0.0, 1.0])).unwrap();
        store.insert(product(3, vec![1.0, 1.0])).unwrap();

        let ids: Vec<u64> = store
            .all_product_records()
            .iter()
            .filter_map(|r| r.owner.product_id())
            .collect();
        assert_eq!(ids, vec![3, 9]);
    }

    #[test]
    fn test_image_lookup_returns_newest() {
        let store = MemoryVectorStore::new(Some(2));
        let old = store.insert(EmbeddingRecord::image("img", vec![1.0, 0.0])).unwrap();
        let new = store.insert(EmbeddingRecord::image("img", vec![0.0, 1.0])).unwrap();

        assert_eq!(store.get_by_image_id("img").unwrap().id, new);
        store.delete(&new);
        assert_eq!(store.get_by_image_id("img").unwrap().id, old);
        store.delete(&old);
        assert!(store.get_by_image_id("img").is_none());
    }

    #[test]
    fn test_purge_images_before() {
        let store = MemoryVectorStore::new(Some(2));
        let mut stale = EmbeddingRecord::image("old", vec![1.0, 0.0]);
        stale.created_at = Utc::now() - chrono::Duration::hours(2);
        store.insert(stale).unwrap();
        store.insert(EmbeddingRecord::image("fresh", vec![1.0, 0.0])).unwrap();
        let mut old_product = product(1, vec![1.0, 0.0]);
        old_product.created_at = Utc::now() - chrono::Duration::hours(2);
        store.insert(old_product).unwrap();

        let purged = store.purge_images_before(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].owner.image_id(), Some("old"));
        assert!(store.get_by_image_id("old").is_none());
        assert!(store.get_by_image_id("fresh").is_some());
        assert_eq!(store.product_count(), 1);
    }
}
