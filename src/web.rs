use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;

use crate::app::{AppContext, AppError};
use crate::semantic::{
    CacheManager, CacheStatus, EmbeddingError, RebuildError, RebuildKind, RebuildReport,
    SearchResponse,
};

/// Files listed by the drive diagnostic.
const SAMPLE_FILES: usize = 5;

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ping", get(ping))
        .route("/api/search", get(search))
        .route("/api/buscarNormativa", get(search))
        .route("/api/warmup", get(warmup).post(warmup))
        .route("/api/refresh-cache", post(refresh))
        .route("/api/status", get(status))
        .route("/api/clear-cache", post(clear))
        .route("/api/debug/env", get(debug_env))
        .route("/api/debug/cache-status", get(status))
        .route("/api/debug/test-drive", get(test_drive))
        .route("/api/debug/test-openai", get(test_openai))
        .layer(CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(ctx)
}

async fn start_app(ctx: AppContext) -> anyhow::Result<()> {
    let addr = ctx.config().listen_addr.clone();
    let app = router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("server stopped");
    Ok(())
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
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::warn!("received Ctrl+C, shutting down"),
        _ = terminate => log::warn!("received SIGTERM, shutting down"),
    }
}

pub fn start_daemon(ctx: AppContext) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(ctx))
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::Rebuild(RebuildError::InProgress) => StatusCode::CONFLICT,
            AppError::Rebuild(RebuildError::EmbeddingUnavailable(_))
            | AppError::Rebuild(RebuildError::NoFolder) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Embedding(EmbeddingError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Rebuild(RebuildError::Drive(_)) | AppError::Embedding(_) => {
                log::error!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Rebuild(_) | AppError::Join(_) | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn index(State(ctx): State<AppContext>) -> Result<Json<serde_json::Value>, HttpError> {
    let cache = cache_status(&ctx).await?;
    Ok(Json(json!({
        "service": "docsift",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": cache,
    })))
}

/// `status()` counts the durable tier, which may be a database round trip.
async fn cache_status(ctx: &AppContext) -> Result<CacheStatus, AppError> {
    let manager = Arc::clone(ctx.manager());
    Ok(tokio::task::spawn_blocking(move || manager.status()).await?)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    /// Query term; `termino` is accepted for older clients
    #[serde(default, alias = "termino")]
    pub q: Option<String>,
    pub top_k: Option<usize>,
}

async fn search(
    State(ctx): State<AppContext>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("search params: {params:?}");

    if params.top_k == Some(0) {
        return Err(AppError::BadRequest("top_k must be greater than 0".to_string()).into());
    }

    let top_k = ctx.config().search.effective_top_k(params.top_k);
    let query = params.q.unwrap_or_default();
    let manager = Arc::clone(ctx.manager());

    // embedding the query is a blocking call
    let response = tokio::task::spawn_blocking(move || manager.search(&query, top_k)).await?;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
pub struct RebuildParams {
    #[serde(default)]
    pub background: bool,
}

async fn warmup(
    State(ctx): State<AppContext>,
    Query(params): Query<RebuildParams>,
) -> Result<axum::response::Response, HttpError> {
    rebuild(ctx, RebuildKind::Warmup, params.background).await
}

async fn refresh(
    State(ctx): State<AppContext>,
    Query(params): Query<RebuildParams>,
) -> Result<axum::response::Response, HttpError> {
    rebuild(ctx, RebuildKind::Refresh, params.background).await
}

async fn rebuild(
    ctx: AppContext,
    kind: RebuildKind,
    background: bool,
) -> Result<axum::response::Response, HttpError> {
    let manager = Arc::clone(ctx.manager());

    if !background {
        let report = tokio::task::spawn_blocking(move || run_kind(&manager, kind)).await??;
        return Ok(Json(report).into_response());
    }

    // claim the slot here so a conflicting request is rejected synchronously
    let Some(ticket) = manager.begin_rebuild(kind)? else {
        let status = cache_status(&ctx).await?;
        return Ok(Json(json!({
            "status": "skipped",
            "message": "cache already warm",
            "cache": status,
        }))
        .into_response());
    };

    let handle = tokio::task::spawn_blocking(move || manager.run_rebuild(ticket));
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(report)) => log::info!(
                "background rebuild finished: generation {}, {} chunk(s)",
                report.generation,
                report.total_chunks
            ),
            Ok(Err(e)) => log::error!("background rebuild failed: {e}"),
            Err(e) => log::error!("background rebuild task aborted: {e}"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": "rebuild started in the background; poll /api/status",
        })),
    )
        .into_response())
}

fn run_kind(manager: &CacheManager, kind: RebuildKind) -> Result<RebuildReport, RebuildError> {
    match kind {
        RebuildKind::Warmup => manager.warmup(),
        RebuildKind::Refresh => manager.refresh(),
    }
}

async fn status(State(ctx): State<AppContext>) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(cache_status(&ctx).await?))
}

async fn clear(State(ctx): State<AppContext>) -> Result<impl IntoResponse, HttpError> {
    let manager = Arc::clone(ctx.manager());
    let report = tokio::task::spawn_blocking(move || manager.clear()).await??;
    Ok(Json(report))
}

async fn debug_env(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.environment())
}

async fn test_drive(State(ctx): State<AppContext>) -> Result<impl IntoResponse, HttpError> {
    let manager = Arc::clone(ctx.manager());
    let check = tokio::task::spawn_blocking(move || manager.check_drive(SAMPLE_FILES)).await??;
    Ok(Json(check))
}

async fn test_openai(State(ctx): State<AppContext>) -> Result<impl IntoResponse, HttpError> {
    let manager = Arc::clone(ctx.manager());
    let check = tokio::task::spawn_blocking(move || manager.check_embeddings()).await??;
    Ok(Json(check))
}
