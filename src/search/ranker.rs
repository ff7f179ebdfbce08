//! Brute-force k-NN ranking with metadata post-filters.
//!
//! Every candidate is scored before filtering; filters only look at the
//! denormalised snapshot already held in memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::search::record::{EmbeddingRecord, ProductSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("Dimension mismatch: query has {query}, candidate has {candidate}")]
    DimensionMismatch { query: usize, candidate: usize },
}

/// Metadata filters applied after scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub min_stock: Option<i64>,
    pub categories: Option<Vec<String>>,
    pub max_price: Option<f64>,
    pub min_price: Option<f64>,
}

impl SearchFilters {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("minPrice", self.min_price), ("maxPrice", self.max_price)] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(format!("{name} must be a non-negative number"));
                }
            }
        }

        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err("minPrice must not exceed maxPrice".to_string());
            }
        }

        Ok(())
    }

    /// Whether a candidate survives. Missing metadata is never excluded.
    pub fn matches(&self, metadata: Option<&ProductSnapshot>) -> bool {
        let Some(meta) = metadata else {
            return true;
        };

        if let Some(min_stock) = self.min_stock {
            if meta.stock.unwrap_or(0) < min_stock {
                return false;
            }
        }

        if let (Some(allowed), Some(category)) = (&self.categories, &meta.category) {
            if !allowed.is_empty() && !allowed.iter().any(|c| c == category) {
                return false;
            }
        }

        if let Some(max_price) = self.max_price {
            if meta.price > max_price {
                return false;
            }
        }

        if let Some(min_price) = self.min_price {
            if meta.price < min_price {
                return false;
            }
        }

        true
    }
}

/// One ranked product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredProduct {
    pub product_id: u64,
    pub name: String,
    pub price: f64,
    pub image: String,
    pub relevancy_score: f32,
    pub distance: f32,
    pub category: Option<String>,
    pub stock: Option<i64>,
}

/// Cosine similarity; 0.0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, RankError> {
    if a.len() != b.len() {
        return Err(RankError::DimensionMismatch {
            query: a.len(),
            candidate: b.len(),
        });
    }

    // f64 accumulators: squares of large f32 components overflow f32
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(similarity.clamp(-1.0, 1.0) as f32)
}

/// Resolve the requested result count: missing or zero falls back to
/// `default`, anything above `max` is capped.
pub fn clamp_top_k(requested: Option<usize>, default: usize, max: usize) -> usize {
    match requested {
        Some(k) if k > 0 => k.min(max),
        _ => default.min(max),
    }
}

/// Rank product candidates against `query`.
///
/// Ties keep the candidates' incoming order.
pub fn rank(
    query: &[f32],
    candidates: &[Arc<EmbeddingRecord>],
    filters: &SearchFilters,
    top_k: usize,
) -> Result<Vec<ScoredProduct>, RankError> {
    let mut scored = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(product_id) = candidate.owner.product_id() else {
            continue;
        };
        let similarity = cosine_similarity(query, &candidate.vector)?;
        scored.push((product_id, candidate, similarity));
    }

    // sort_by is stable
    scored.sort_by(|a, b| b.2.total_cmp(&a.2));

    Ok(scored
        .into_iter()
        .filter(|(_, candidate, _)| filters.matches(candidate.metadata.as_ref()))
        .take(top_k)
        .map(|(product_id, candidate, similarity)| {
            let meta = candidate.metadata.clone().unwrap_or_default();
            ScoredProduct {
                product_id,
                name: meta.name,
                price: meta.price,
                image: meta.image,
                relevancy_score: similarity,
                distance: 1.0 - similarity,
                category: meta.category,
                stock: meta.stock,
            }
        })
        .collect())
}
