//! Product catalog lookups used by the indexer.
//!
//! The catalog is owned elsewhere; this module only needs a product's
//! canonical image and the fields that get snapshotted next to its vector.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::search::record::ProductSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub price: f64,
    /// Canonical image locator: an http(s) URL or a local path.
    pub image: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub stock: Option<i64>,
}

impl Product {
    pub fn snapshot(&self) -> ProductSnapshot {
        ProductSnapshot {
            name: self.name.clone(),
            price: self.price,
            image: self.image.clone(),
            category: self.category.clone(),
            stock: self.stock,
        }
    }
}

pub trait Catalog: Send + Sync {
    fn product(&self, id: u64) -> Option<Product>;

    fn product_ids(&self) -> Vec<u64>;
}

#[derive(Default)]
pub struct MemoryCatalog {
    products: RwLock<HashMap<u64, Product>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON array of products. A missing file yields an empty catalog.
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let catalog = Self::new();
        if !path.exists() {
            log::info!("No catalog file at {}, starting empty", path.display());
            return Ok(catalog);
        }

        let data = std::fs::read(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let products: Vec<Product> = serde_json::from_slice(&data)
            .with_context(|| format!("catalog {} is malformed", path.display()))?;

        let count = catalog.register(products);
        log::info!("Loaded {count} products from {}", path.display());
        Ok(catalog)
    }

    /// Insert or overwrite products, returning how many were given.
    pub fn register(&self, products: Vec<Product>) -> usize {
        let mut map = self.products.write().unwrap_or_else(PoisonError::into_inner);
        let count = products.len();
        for product in products {
            map.insert(product.id, product);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Catalog for MemoryCatalog {
    fn product(&self, id: u64) -> Option<Product> {
        self.products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn product_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}
