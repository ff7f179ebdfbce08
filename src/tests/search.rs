use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::AppError;
use crate::app::service::{HealthStatus, SearchRequest};
use crate::app::tasks::ImageStatus;
use crate::images::tests::solid_png;
use crate::search::{ImageEmbedder, ImageSource, ModelLoader, SearchFilters};
use crate::storage::StorageManager;
use crate::tests::support::{self, ColorEmbedder};

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const BLUE: [u8; 3] = [0, 0, 255];

fn ids(results: &[crate::search::ScoredProduct]) -> Vec<u64> {
    results.iter().map(|r| r.product_id).collect()
}

#[tokio::test]
async fn test_upload_then_query_ranks_closest_first() {
    let (service, tmp) = support::create_service();
    support::seed_products(
        &service,
        tmp.path(),
        &[
            (1, RED, Some(3), Some("shoes"), 10.0),
            (2, GREEN, Some(3), Some("bags"), 20.0),
            (3, BLUE, Some(3), Some("hats"), 30.0),
        ],
    );
    let report = service.index_all().await;
    assert_eq!((report.indexed, report.failed), (3, 0));

    let receipt = service.upload_bytes(solid_png(16, 16, RED)).await.unwrap();
    assert_eq!(receipt.status, ImageStatus::Ready);
    assert!(receipt.image_url.ends_with(".png"));

    let results = service
        .search(&receipt.image_id, SearchRequest::default())
        .await
        .unwrap();

    assert_eq!(ids(&results), vec![1, 2, 3]);
    assert!((results[0].relevancy_score - 1.0).abs() < 1e-5);
    assert!(results[0].distance.abs() < 1e-5);
    assert_eq!(results[0].name, "product 1");
    assert_eq!(results[0].category.as_deref(), Some("shoes"));
}

#[tokio::test]
async fn test_min_stock_filter_ignores_rank() {
    let (service, tmp) = support::create_service();
    support::seed_products(
        &service,
        tmp.path(),
        &[
            (1, RED, Some(0), None, 10.0),
            (2, GREEN, Some(5), None, 10.0),
            (3, BLUE, Some(10), None, 10.0),
        ],
    );
    service.index_all().await;
    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();

    let request = SearchRequest {
        filters: SearchFilters {
            min_stock: Some(5),
            ..Default::default()
        },
        ..Default::default()
    };
    let results = service.search(&receipt.image_id, request).await.unwrap();

    assert_eq!(ids(&results), vec![2, 3]);
}

#[tokio::test]
async fn test_top_k_is_clamped() {
    let (service, tmp) = support::create_service_with(
        |config| config.search.max_top_k = 2,
        support::color_loader(3),
    );
    support::seed_products(
        &service,
        tmp.path(),
        &[
            (1, RED, None, None, 1.0),
            (2, GREEN, None, None, 1.0),
            (3, BLUE, None, None, 1.0),
        ],
    );
    service.index_all().await;
    let receipt = service.upload_bytes(solid_png(4, 4, BLUE)).await.unwrap();

    let request = SearchRequest {
        top_k: Some(10_000),
        ..Default::default()
    };
    let results = service.search(&receipt.image_id, request).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].product_id, 3);
}

#[tokio::test]
async fn test_empty_store_returns_no_results() {
    let (service, _tmp) = support::create_service();
    let receipt = service.upload_bytes(solid_png(4, 4, GREEN)).await.unwrap();

    let results = service
        .search(&receipt.image_id, SearchRequest::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_pending_upload_is_not_ready_then_ready() {
    let loader: ModelLoader = Arc::new(|| {
        Ok(Arc::new(ColorEmbedder::new(3).with_delay(Duration::from_millis(400)))
            as Arc<dyn ImageEmbedder>)
    });
    let (service, _tmp) =
        support::create_service_with(|config| config.upload.wait_for_embedding_ms = 0, loader);

    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();
    assert_eq!(receipt.status, ImageStatus::Pending);
    assert_eq!(
        service.image_status(&receipt.image_id).unwrap(),
        ImageStatus::Pending
    );

    let early = service
        .search(&receipt.image_id, SearchRequest::default())
        .await;
    assert!(matches!(early, Err(AppError::NotReady(_))));

    let request = SearchRequest {
        wait: Duration::from_secs(5),
        ..Default::default()
    };
    let results = service.search(&receipt.image_id, request).await;
    assert!(results.is_ok());
    assert_eq!(
        service.image_status(&receipt.image_id).unwrap(),
        ImageStatus::Ready
    );
}

#[tokio::test]
async fn test_failed_model_load_degrades_without_crashing() {
    let (service, _tmp) = support::create_service_with(|_| {}, support::failing_loader());

    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();
    assert!(matches!(receipt.status, ImageStatus::Failed { .. }));

    let result = service
        .search(&receipt.image_id, SearchRequest::default())
        .await;
    assert!(matches!(result, Err(AppError::Extraction(_))));
    assert_eq!(service.health().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_health_after_warm_up() {
    let (service, tmp) = support::create_service();
    let health = service.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.last_updated, None);

    service.warm_up().await.unwrap();
    support::seed_products(&service, tmp.path(), &[(1, RED, None, None, 1.0)]);
    service.index_products(&[1]).await;

    let health = service.health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.indexed_products, 1);
    assert_eq!(health.vector_dimensions, 3);
    assert!(health.last_updated.is_some());
}

#[tokio::test]
async fn test_batch_partial_failure() {
    let (service, tmp) = support::create_service();
    support::seed_products(
        &service,
        tmp.path(),
        &[(1, RED, None, None, 1.0), (2, GREEN, None, None, 1.0)],
    );

    let report = service.index_products(&[1, 404, 2]).await;

    assert_eq!((report.indexed, report.failed), (2, 1));
    assert!(service.product_embedding(1).is_ok());
    assert!(service.product_embedding(2).is_ok());
}

#[tokio::test]
async fn test_reindex_keeps_one_record() {
    let (service, tmp) = support::create_service();
    support::seed_products(&service, tmp.path(), &[(1, RED, None, None, 1.0)]);

    service.index_products(&[1]).await;
    service.index_products(&[1]).await;

    assert_eq!(service.store().product_count(), 1);
    assert_eq!(service.store().all_product_records().len(), 1);
}

#[tokio::test]
async fn test_unindex_product() {
    let (service, tmp) = support::create_service();
    support::seed_products(&service, tmp.path(), &[(1, RED, None, None, 1.0)]);
    service.index_products(&[1]).await;

    service.unindex_product(1).await.unwrap();

    assert!(matches!(service.product_embedding(1), Err(AppError::NotFound(_))));
    assert!(matches!(
        service.unindex_product(1).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_image_is_idempotent() {
    let (service, tmp) = support::create_service();
    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();
    assert_eq!(std::fs::read_dir(tmp.path().join("uploads")).unwrap().count(), 1);

    assert!(service.delete_image(&receipt.image_id).await.unwrap());
    assert!(!service.delete_image(&receipt.image_id).await.unwrap());

    assert_eq!(std::fs::read_dir(tmp.path().join("uploads")).unwrap().count(), 0);
    assert!(service.store().get_by_image_id(&receipt.image_id).is_none());
    let result = service
        .search(&receipt.image_id, SearchRequest::default())
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_stored_upload_is_extracted_on_demand() {
    let (service, tmp) = support::create_service();
    support::seed_products(&service, tmp.path(), &[(1, GREEN, None, None, 1.0)]);
    service.index_all().await;

    // an upload left by an earlier run, with no vector in memory
    let image_id = crate::eid::Eid::new().to_string();
    std::fs::write(
        tmp.path().join("uploads").join(format!("{image_id}.png")),
        solid_png(4, 4, GREEN),
    )
    .unwrap();
    assert_eq!(service.image_status(&image_id).unwrap(), ImageStatus::Pending);

    let results = service
        .search(&image_id, SearchRequest::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![1]);
    assert!(service.store().get_by_image_id(&image_id).is_some());
}

#[tokio::test]
async fn test_unknown_and_invalid_image_ids() {
    let (service, _tmp) = support::create_service();

    let missing = service.search("01AAAAAAAAAAAAAAAAAAAAAAAA", SearchRequest::default()).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));

    let invalid = service.search("../etc", SearchRequest::default()).await;
    assert!(matches!(invalid, Err(AppError::Validation(_))));

    let empty = service.search("", SearchRequest::default()).await;
    assert!(matches!(empty, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_invalid_filters_are_rejected() {
    let (service, _tmp) = support::create_service();
    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();

    let request = SearchRequest {
        filters: SearchFilters {
            min_price: Some(50.0),
            max_price: Some(10.0),
            ..Default::default()
        },
        ..Default::default()
    };
    let result = service.search(&receipt.image_id, request).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_upload_rejects_bad_input() {
    let (service, _tmp) = support::create_service_with(
        |config| config.upload.max_bytes = 64,
        support::color_loader(3),
    );

    let too_large = service.upload_bytes(vec![0u8; 65]).await;
    assert!(matches!(too_large, Err(AppError::PayloadTooLarge { limit: 64 })));

    let not_image = service.upload_bytes(b"plain text, not pixels".to_vec()).await;
    assert!(matches!(not_image, Err(AppError::Decode(_))));
}

#[tokio::test]
async fn test_search_by_image_bytes() {
    let (service, tmp) = support::create_service_with(
        |config| config.upload.wait_for_embedding_ms = 0,
        support::color_loader(3),
    );
    support::seed_products(
        &service,
        tmp.path(),
        &[(1, RED, None, None, 1.0), (2, BLUE, None, None, 1.0)],
    );
    service.index_all().await;

    let (receipt, results) = service
        .search_by_image_bytes(solid_png(4, 4, BLUE), SearchRequest::default())
        .await
        .unwrap();

    assert_eq!(results[0].product_id, 2);
    assert!(service.store().get_by_image_id(&receipt.image_id).is_some());
}

#[tokio::test]
async fn test_search_source_does_not_keep_upload() {
    let (service, tmp) = support::create_service();
    support::seed_products(
        &service,
        tmp.path(),
        &[(1, RED, None, None, 1.0), (2, GREEN, None, None, 1.0)],
    );
    service.index_all().await;

    let path = tmp.path().join("query.png");
    std::fs::write(&path, solid_png(4, 4, GREEN)).unwrap();
    let results = service
        .search_source(ImageSource::Path(path), SearchRequest::default())
        .await
        .unwrap();

    assert_eq!(results[0].product_id, 2);
    assert_eq!(std::fs::read_dir(tmp.path().join("uploads")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_sweep_removes_expired_images() {
    let (service, _tmp) = support::create_service_with(
        |config| config.upload.image_ttl_secs = 1,
        support::color_loader(3),
    );
    let receipt = service.upload_bytes(solid_png(4, 4, RED)).await.unwrap();
    assert_eq!(service.sweep_expired_images().await, 0);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(service.sweep_expired_images().await, 1);
    assert!(service.store().get_by_image_id(&receipt.image_id).is_none());
    assert!(service.tasks().status(&receipt.image_id).is_none());
    assert!(matches!(
        service.image_status(&receipt.image_id),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let build = || {
        let mut config = support::test_config(tmp.path());
        config.search.persist = true;
        crate::app::AppFactory::new(config)
            .with_loader(support::color_loader(3))
            .build()
            .unwrap()
    };

    let first = build();
    support::seed_products(
        &first,
        tmp.path(),
        &[(1, RED, Some(2), None, 1.0), (2, GREEN, Some(4), None, 1.0)],
    );
    first.index_all().await;
    assert!(tmp.path().join("vectors.bin").exists());

    let second = build();
    assert_eq!(second.load_snapshot().await.unwrap(), 2);
    assert_eq!(second.store().product_count(), 2);
    assert!(second.health().last_updated.is_some());

    let record = second.product_embedding(2).unwrap();
    assert_eq!(record.metadata.as_ref().unwrap().stock, Some(4));
}

#[tokio::test]
async fn test_snapshot_from_other_model_is_discarded() {
    let tmp = tempfile::tempdir().unwrap();
    let build = |model: &str| {
        let mut config = support::test_config(tmp.path());
        config.search.persist = true;
        config.search.model = model.to_string();
        crate::app::AppFactory::new(config)
            .with_loader(support::color_loader(3))
            .build()
            .unwrap()
    };

    let first = build("color-mean");
    support::seed_products(&first, tmp.path(), &[(1, RED, None, None, 1.0)]);
    first.index_all().await;

    let second = build("other-model");
    assert_eq!(second.load_snapshot().await.unwrap(), 0);
    assert_eq!(second.store().product_count(), 0);
}

#[tokio::test]
async fn test_uploads_dir_holds_only_accepted_files() {
    let (service, tmp) = support::create_service();
    let receipt = service
        .upload_bytes(crate::images::tests::solid_jpeg(4, 4, BLUE))
        .await
        .unwrap();

    let storage = crate::storage::BackendLocal::new(tmp.path().join("uploads")).unwrap();
    assert_eq!(
        storage.find_by_stem(&receipt.image_id),
        Some(format!("{}.jpg", receipt.image_id))
    );
}
