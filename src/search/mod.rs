//! Image similarity search over catalog product embeddings.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed's image models behind `ImageEmbedder`
//! - `extractor`: Lazily loaded model, image fetching and bounded inference
//! - `record`: Embedding records and the denormalized product snapshot
//! - `store`: Vector store trait and the in-memory implementation
//! - `ranker`: Cosine scoring, post-sort filters and top-k truncation
//! - `cache`: LRU memo of embeddings keyed by image locator
//! - `indexer`: Bulk product indexing on a bounded worker pool
//! - `snapshot`: Binary vectors.bin persistence

pub mod cache;
pub mod embeddings;
pub mod extractor;
pub mod indexer;
pub mod ranker;
pub mod record;
pub mod snapshot;
pub mod store;

pub use cache::EmbeddingCache;
pub use embeddings::{EmbeddingError, FastembedImageModel, ImageEmbedder};
pub use extractor::{ExtractError, Extractor, ExtractorOptions, ImageSource, ModelLoader, ModelState};
pub use indexer::{IndexReport, Indexer};
pub use ranker::{ScoredProduct, SearchFilters};
pub use record::{EmbeddingRecord, ProductSnapshot, RecordKind, RecordOwner};
pub use snapshot::{SnapshotError, VectorSnapshot};
pub use store::{MemoryVectorStore, StoreError, VectorStore};

/// Default image model (ResNet-50 pooled features, 2048 dimensions).
pub const DEFAULT_MODEL: &str = "resnet50";

pub const DEFAULT_DIMENSIONS: usize = 2048;

pub const DEFAULT_TOP_K: usize = 50;

/// Hard ceiling on results per query regardless of what the caller asks for.
pub const MAX_TOP_K: usize = 500;
