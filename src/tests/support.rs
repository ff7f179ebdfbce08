//! Shared fixtures: a deterministic stand-in model and isolated service setups.

use std::sync::Arc;
use std::time::Duration;

use crate::app::factory::AppFactory;
use crate::app::service::AppService;
use crate::catalog::Product;
use crate::config::Config;
use crate::images::tests::solid_png;
use crate::search::embeddings::{EmbeddingError, ImageEmbedder};
use crate::search::extractor::{ExtractorOptions, ModelLoader};
use crate::storage::{BackendLocal, StorageManager};

/// Embeds an image as its mean colour, tiled to `dims` values.
///
/// Distinct solid colours give distinct directions, so nearest-neighbour
/// tests can reason about which product wins.
pub struct ColorEmbedder {
    dims: usize,
    delay: Duration,
}

impl ColorEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ImageEmbedder for ColorEmbedder {
    fn name(&self) -> &str {
        "color-mean"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, image: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let rgb = image::load_from_memory(image)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .to_rgb8();

        let mut sums = [0f64; 3];
        for pixel in rgb.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += channel as f64;
            }
        }
        let count = (rgb.width() as f64 * rgb.height() as f64).max(1.0);
        let mean: Vec<f32> = sums.iter().map(|s| (s / count / 255.0) as f32).collect();

        Ok((0..self.dims).map(|i| mean[i % 3]).collect())
    }
}

pub fn color_loader(dims: usize) -> ModelLoader {
    Arc::new(move || Ok(Arc::new(ColorEmbedder::new(dims)) as Arc<dyn ImageEmbedder>))
}

pub fn failing_loader() -> ModelLoader {
    Arc::new(|| Err(EmbeddingError::InitFailed("weights unavailable".to_string())))
}

pub fn extractor_options(dims: usize) -> ExtractorOptions {
    ExtractorOptions {
        model_name: "color-mean".to_string(),
        dimensions: Some(dims),
        load_timeout: Duration::from_secs(5),
        extraction_timeout: Duration::from_secs(5),
        fetch_timeout: Duration::from_secs(2),
        max_bytes: 5 * 1024 * 1024,
    }
}

pub fn temp_storage() -> (Arc<dyn StorageManager>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let storage = BackendLocal::new(tmp.path().join("uploads")).expect("failed to create storage");
    (Arc::new(storage), tmp)
}

/// Config for tests: tiny vectors, short waits, no persistence.
pub fn test_config(base: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.base_path = base.to_path_buf();
    config.search.model = "color-mean".to_string();
    config.search.dimensions = 3;
    config.search.extraction_timeout_secs = 5;
    config.search.persist = false;
    config.search.preload_model = false;
    config.upload.wait_for_embedding_ms = 2_000;
    config
}

/// A service in a fresh temp directory backed by the colour embedder.
pub fn create_service() -> (AppService, tempfile::TempDir) {
    create_service_with(|_| {}, color_loader(3))
}

pub fn create_service_with(
    tweak: impl FnOnce(&mut Config),
    loader: ModelLoader,
) -> (AppService, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = test_config(tmp.path());
    tweak(&mut config);

    let service = AppFactory::new(config)
        .with_loader(loader)
        .build()
        .expect("failed to build service");
    (service, tmp)
}

/// Register products whose images are solid-colour PNGs on disk.
pub fn seed_products(
    service: &AppService,
    dir: &std::path::Path,
    products: &[(u64, [u8; 3], Option<i64>, Option<&str>, f64)],
) {
    let products = products
        .iter()
        .map(|&(id, rgb, stock, category, price)| {
            let path = dir.join(format!("product-{id}.png"));
            std::fs::write(&path, solid_png(8, 8, rgb)).expect("failed to write image");
            Product {
                id,
                name: format!("product {id}"),
                price,
                image: path.to_string_lossy().into_owned(),
                category: category.map(str::to_string),
                stock,
            }
        })
        .collect();
    service.register_products(products);
}
