use crate::{
    app::{
        service::{HealthReport, HealthStatus, SearchRequest, UploadReceipt},
        tasks::ImageStatus,
        AppError, AppService,
    },
    catalog::Product,
    search::{EmbeddingRecord, ScoredProduct, SearchFilters},
};
use anyhow::Context;
use axum::{
    async_trait,
    extract::{
        rejection::{PathRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State,
    },
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, time::Duration};
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    service: AppService,
}

pub fn router(service: AppService) -> Router {
    let max_bytes = service.config().upload.max_bytes;
    // base64 bodies are a third larger, multipart adds boundaries
    let body_limit = max_bytes + max_bytes / 3 + 64 * 1024;
    let uploads_path = service.config().uploads_path();

    Router::new()
        .nest_service("/uploads", tower_http::services::ServeDir::new(uploads_path))
        .route("/upload", post(upload))
        .route("/query", get(query))
        .route("/search", post(search))
        .route("/index", post(index))
        .route("/products", post(register_products))
        .route(
            "/embeddings/:product_id",
            get(get_embedding).delete(delete_embedding),
        )
        .route("/images/:image_id", axum::routing::delete(delete_image))
        .route("/images/:image_id/status", get(image_status))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(SharedState { service })
}

async fn start_app(service: AppService) -> anyhow::Result<()> {
    if let Err(e) = service.load_snapshot().await {
        log::error!("Failed to load vectors: {e}");
    }

    if service.config().search.preload_model {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.warm_up().await {
                log::error!("model preload failed, will retry on first request: {e}");
            }
        });
    }

    let sweeper = spawn_sweeper(service.clone());

    let bind = service.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log::info!("listening on {bind}");

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    log::warn!("shutting down, saving vectors");
    if let Err(e) = service.save_snapshot().await {
        log::error!("failed to save vectors on shutdown: {e}");
    }

    Ok(())
}

pub fn start_daemon(service: AppService) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(service))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn spawn_sweeper(service: AppService) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(service.config().upload.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            service.sweep_expired_images().await;
        }
    })
}

#[derive(Debug)]
pub struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) | AppError::NotReady(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::Decode(_) | AppError::Fetch(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Extraction(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DimensionMismatch { .. } | AppError::StorageIo(_) | AppError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self.0 {
            AppError::StorageIo(_) | AppError::Other(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            log::error!("{self:?}");
        }

        (status, Json(json!({"error": message}))).into_response()
    }
}

// This enables using `?` on functions that return `Result<_, AppError>`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Map a body rejection, keeping the size limit distinct from bad input.
fn rejection(status: StatusCode, text: String, limit: usize) -> HttpError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        HttpError(AppError::PayloadTooLarge { limit })
    } else {
        HttpError(AppError::Validation(text))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    url: Option<String>,
    image_b64: Option<String>,
}

/// An image given as multipart field `image`/`file`, or JSON `{url}` / `{imageB64}`.
enum UploadPayload {
    Bytes(Vec<u8>),
    Url(String),
}

impl Debug for UploadPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadPayload::Bytes(bytes) => write!(f, "Bytes([{} bytes])", bytes.len()),
            UploadPayload::Url(url) => write!(f, "Url({url:?})"),
        }
    }
}

#[async_trait]
impl FromRequest<SharedState> for UploadPayload {
    type Rejection = HttpError;

    async fn from_request(req: Request, state: &SharedState) -> Result<Self, Self::Rejection> {
        let limit = state.service.config().upload.max_bytes;
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| rejection(e.status(), e.body_text(), limit))?;

            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| rejection(e.status(), e.body_text(), limit))?
            {
                if matches!(field.name(), Some("image" | "file")) {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| rejection(e.status(), e.body_text(), limit))?;
                    return Ok(UploadPayload::Bytes(bytes.to_vec()));
                }
            }

            return Err(AppError::validation("multipart body has no `image` field").into());
        }

        let Json(body) = Json::<UploadBody>::from_request(req, state)
            .await
            .map_err(|e| rejection(e.status(), e.body_text(), limit))?;

        match (body.url, body.image_b64) {
            (Some(url), _) => Ok(UploadPayload::Url(url)),
            (None, Some(b64)) => STANDARD
                .decode(b64.trim())
                .map(UploadPayload::Bytes)
                .map_err(|e| AppError::validation(format!("invalid imageB64: {e}")).into()),
            (None, None) => Err(AppError::validation("expected an image file, `url` or `imageB64`").into()),
        }
    }
}

async fn upload(
    State(state): State<SharedState>,
    payload: UploadPayload,
) -> Result<Json<UploadReceipt>, HttpError> {
    log::debug!("payload: {payload:?}");

    let receipt = match payload {
        UploadPayload::Bytes(bytes) => state.service.upload_bytes(bytes).await?,
        UploadPayload::Url(url) => state.service.upload_url(&url).await?,
    };
    Ok(Json(receipt))
}

/// Query string of `/query` and `/search`; the latter ignores `imageId` and `waitMs`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankParams {
    image_id: Option<String>,
    wait_ms: Option<u64>,
    top_k: Option<usize>,
    min_stock: Option<i64>,
    /// Comma separated.
    categories: Option<String>,
    max_price: Option<f64>,
    min_price: Option<f64>,
}

impl RankParams {
    fn into_request(self, wait: Duration) -> SearchRequest {
        let categories = self.categories.map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        });

        SearchRequest {
            top_k: self.top_k,
            filters: SearchFilters {
                min_stock: self.min_stock,
                categories,
                max_price: self.max_price,
                min_price: self.min_price,
            },
            wait,
        }
    }
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, HttpError> {
    params
        .map(|Query(params)| params)
        .map_err(|e| AppError::Validation(e.body_text()).into())
}

async fn query(
    State(state): State<SharedState>,
    params: Result<Query<RankParams>, QueryRejection>,
) -> Result<Json<Vec<ScoredProduct>>, HttpError> {
    let mut params = query_params(params)?;
    log::debug!("query: {params:?}");

    let image_id = params
        .image_id
        .take()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::validation("imageId is required"))?;
    let wait = Duration::from_millis(params.wait_ms.unwrap_or(0));

    let results = state
        .service
        .search(&image_id, params.into_request(wait))
        .await?;
    Ok(Json(results))
}

#[derive(Serialize)]
struct SearchResponse {
    #[serde(flatten)]
    upload: UploadReceipt,
    results: Vec<ScoredProduct>,
}

async fn search(
    State(state): State<SharedState>,
    params: Result<Query<RankParams>, QueryRejection>,
    payload: UploadPayload,
) -> Result<Json<SearchResponse>, HttpError> {
    let request = query_params(params)?.into_request(Duration::ZERO);

    let (upload, results) = match payload {
        UploadPayload::Bytes(bytes) => state.service.search_by_image_bytes(bytes, request).await?,
        UploadPayload::Url(url) => state.service.search_by_image_url(&url, request).await?,
    };
    Ok(Json(SearchResponse { upload, results }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexRequest {
    product_ids: Vec<u64>,
}

async fn index(
    State(state): State<SharedState>,
    payload: Result<Json<IndexRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let Json(payload) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let report = state.service.index_products(&payload.product_ids).await;
    Ok(Json(json!({
        "indexed": report.indexed,
        "failed": report.failed,
        "message": format!("Indexed {} products, {} failed", report.indexed, report.failed),
    })))
}

async fn register_products(
    State(state): State<SharedState>,
    payload: Result<Json<Vec<Product>>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let Json(products) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let registered = state.service.register_products(products);
    Ok(Json(json!({
        "registered": registered,
        "total": state.service.catalog_len(),
    })))
}

fn product_id(path: Result<Path<u64>, PathRejection>) -> Result<u64, HttpError> {
    path.map(|Path(id)| id)
        .map_err(|_| AppError::validation("productId must be a non-negative integer").into())
}

async fn get_embedding(
    State(state): State<SharedState>,
    path: Result<Path<u64>, PathRejection>,
) -> Result<Json<EmbeddingRecord>, HttpError> {
    let record = state.service.product_embedding(product_id(path)?)?;
    Ok(Json(record.as_ref().clone()))
}

async fn delete_embedding(
    State(state): State<SharedState>,
    path: Result<Path<u64>, PathRejection>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let id = product_id(path)?;
    state.service.unindex_product(id).await?;
    Ok(Json(json!({"productId": id, "deleted": true})))
}

async fn delete_image(
    State(state): State<SharedState>,
    Path(image_id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let deleted = state.service.delete_image(&image_id).await?;
    Ok(Json(json!({"imageId": image_id, "deleted": deleted})))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    image_id: String,
    #[serde(flatten)]
    status: ImageStatus,
}

async fn image_status(
    State(state): State<SharedState>,
    Path(image_id): Path<String>,
) -> Result<Json<StatusResponse>, HttpError> {
    let status = state.service.image_status(&image_id)?;
    Ok(Json(StatusResponse { image_id, status }))
}

async fn health(State(state): State<SharedState>) -> axum::response::Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.health()).await {
        Ok(report) => Json::<HealthReport>(report).into_response(),
        Err(e) => {
            log::error!("health report failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": HealthStatus::Offline,
                    "error": "health report unavailable",
                })),
            )
                .into_response()
        }
    }
}
