use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::timeout::TimeoutLayer;

use crate::config::BikeConfig;
use crate::engine::MetricsEngine;
use crate::error::BikeError;
use crate::exposition;
use crate::log_buffer::LogBuffer;
use crate::state::MetricsSnapshot;

/// Shared by every handler on every listener
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MetricsEngine>,
    pub logs: LogBuffer,
}

/// Endpoint families, each bound to its own configured port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Metrics,
    Service,
    Logs,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Metrics, Family::Service, Family::Logs];

    pub fn port(self, config: &BikeConfig) -> u16 {
        match self {
            Family::Metrics => config.metrics_port,
            Family::Service => config.service_port,
            Family::Logs => config.logs_port,
        }
    }

    fn routes(self) -> Router<AppState> {
        match self {
            Family::Metrics => Router::new()
                .route("/metrics", get(metrics_handler))
                .route("/status", get(status_handler)),
            Family::Service => {
                Router::new().route("/service", get(service_handler).post(service_handler))
            }
            Family::Logs => Router::new().route("/logs", get(logs_handler)),
        }
    }
}

/// Handler fault, rendered as a plaintext 500
pub struct ApiError(BikeError);

impl From<BikeError> for ApiError {
    fn from(err: BikeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("request failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal Server Error: {}\n", self.0),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.engine.get_metrics_snapshot()?;
    Ok((
        [(header::CONTENT_TYPE, exposition::CONTENT_TYPE)],
        exposition::render(&snapshot),
    )
        .into_response())
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<MetricsSnapshot>, ApiError> {
    Ok(Json(state.engine.get_metrics_snapshot()?))
}

async fn service_handler(State(state): State<AppState>) -> String {
    let report = state.engine.disable_service().await;
    if report.silenced {
        "Service disabled, warning silenced\n".to_string()
    } else {
        "Service disabled\n".to_string()
    }
}

async fn logs_handler(State(state): State<AppState>) -> String {
    state.logs.dump()
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// One router per distinct port; families sharing a port are merged
pub fn routers_by_port(state: AppState, config: &BikeConfig) -> BTreeMap<u16, Router> {
    let mut grouped: BTreeMap<u16, Router<AppState>> = BTreeMap::new();
    for family in Family::ALL {
        let port = family.port(config);
        let router = match grouped.remove(&port) {
            Some(existing) => existing.merge(family.routes()),
            None => family.routes(),
        };
        grouped.insert(port, router);
    }

    grouped
        .into_iter()
        .map(|(port, router)| {
            let app = router
                .fallback(not_found)
                .layer(TimeoutLayer::new(config.request_timeout()))
                .with_state(state.clone());
            (port, app)
        })
        .collect()
}

/// Bind every listener and serve until `shutdown` flips to true.
/// Fails fast if any port cannot be bound.
pub async fn serve_all(
    state: AppState,
    config: &BikeConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut listeners = Vec::new();
    for (port, app) in routers_by_port(state, config) {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", addr, e))?;
        log::info!("listening on http://{}", addr);
        listeners.push((listener, app));
    }

    let mut servers = JoinSet::new();
    for (listener, app) in listeners {
        let mut stop = shutdown.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*stop.borrow() {
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
        });
    }

    while let Some(joined) = servers.join_next().await {
        joined??;
    }
    log::info!("http listeners stopped");
    Ok(())
}
