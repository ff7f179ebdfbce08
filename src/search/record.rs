//! Embedding records held by the vector store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;

/// What a record's vector was extracted from.
///
/// Encoding the owner as an enum keeps `productId` and `imageId` mutually
/// exclusive and always consistent with the record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordOwner {
    /// An indexed catalog product.
    Product {
        #[serde(rename = "productId")]
        product_id: u64,
    },
    /// An ephemeral uploaded query image.
    Image {
        #[serde(rename = "imageId")]
        image_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Product,
    Image,
}

impl RecordOwner {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordOwner::Product { .. } => RecordKind::Product,
            RecordOwner::Image { .. } => RecordKind::Image,
        }
    }

    pub fn product_id(&self) -> Option<u64> {
        match self {
            RecordOwner::Product { product_id } => Some(*product_id),
            RecordOwner::Image { .. } => None,
        }
    }

    pub fn image_id(&self) -> Option<&str> {
        match self {
            RecordOwner::Image { image_id } => Some(image_id),
            RecordOwner::Product { .. } => None,
        }
    }
}

/// Catalog fields copied at index time so filters never hit the catalog.
///
/// May drift from the catalog until the product is re-indexed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRecord {
    pub id: Eid,
    #[serde(flatten)]
    pub owner: RecordOwner,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProductSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// A product record; the id is assigned by the store on insert.
    pub fn product(product_id: u64, vector: Vec<f32>, metadata: Option<ProductSnapshot>) -> Self {
        Self {
            id: Eid::unassigned(),
            owner: RecordOwner::Product { product_id },
            vector,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// An uploaded-image record; the id is assigned by the store on insert.
    pub fn image(image_id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: Eid::unassigned(),
            owner: RecordOwner::Image {
                image_id: image_id.into(),
            },
            vector,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.owner.kind()
    }
}
