use crate::{
    app::{App, AppError, ItemOutcome},
    refresh::DailySchedule,
    rerank::RerankResult,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

pub fn router(app: Arc<App>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/product/", get(empty_target))
        .route("/product/:target", get(find_similar))
        .route("/products", post(find_similar_bulk))
        .route("/admin/reindex", post(reindex))
        .route("/admin/invalidate", post(invalidate))
        .route("/admin/reload", post(reload))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(stop: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
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

    log::warn!("shutting down");
    stop.store(true, Ordering::Relaxed);
}

async fn start_app(app: Arc<App>, addr: &str, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("listening on {addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal(stop))
        .await
        .context("HTTP server failed")
}

/// Serve `app` on `addr` until Ctrl+C or SIGTERM, running the catalog
/// refresh schedule on a background thread when given.
pub fn start_daemon(
    app: Arc<App>,
    addr: &str,
    schedule: Option<DailySchedule>,
) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));

    let scheduler = schedule.map(|schedule| {
        let index = app.index().clone();
        let stop = stop.clone();
        std::thread::spawn(move || schedule.run(index.as_ref(), &stop))
    });

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?
        .block_on(start_app(app.clone(), addr, stop.clone()));

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = scheduler {
        log::warn!("waiting for refresh scheduler to stop");
        if handle.join().is_err() {
            log::error!("refresh scheduler panicked");
        }
    }

    result
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self.0 {
            AppError::EmptyTarget => StatusCode::BAD_REQUEST,
            err if err.is_retry_exhausted() => StatusCode::TOO_MANY_REQUESTS,
            err if err.is_malformed_output() => StatusCode::BAD_GATEWAY,
            err if err.is_deadline() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            log::error!("{:?}", self.0);
        }

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

async fn empty_target() -> HttpError {
    HttpError(AppError::EmptyTarget)
}

async fn find_similar(
    State(state): State<Arc<SharedState>>,
    Path(target): Path<String>,
) -> Result<Json<RerankResult>, HttpError> {
    log::debug!("target: {target:?}");

    let app = state.app.clone();

    tokio::task::block_in_place(move || app.find_similar(&target).map(Json).map_err(Into::into))
}

async fn find_similar_bulk(
    State(state): State<Arc<SharedState>>,
    Json(targets): Json<Vec<String>>,
) -> Json<Vec<ItemOutcome>> {
    log::debug!("bulk query of {} targets", targets.len());

    let app = state.app.clone();

    tokio::task::block_in_place(move || Json(app.find_similar_bulk(&targets)))
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReindexResponse {
    pub chunks: usize,
}

async fn reindex(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ReindexResponse>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.reindex()
            .map(|chunks| ReindexResponse { chunks }.into())
            .map_err(Into::into)
    })
}

async fn invalidate(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || app.invalidate_index())?;
    Ok(Json(json!({"invalidated": true})))
}

async fn reload(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || app.reload_index());
    Json(json!({"reloaded": true}))
}
