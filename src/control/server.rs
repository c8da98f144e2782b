//! HTTP 控制接口 (axum)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use super::{ControlReply, ControlSurface};

impl IntoResponse for ControlReply {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlReply::Ok(_) => StatusCode::OK,
            ControlReply::Accepted(_) => StatusCode::ACCEPTED,
            ControlReply::Conflict(_) => StatusCode::CONFLICT,
            ControlReply::Invalid(_) => StatusCode::BAD_REQUEST,
            ControlReply::Error(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match self {
            ControlReply::Ok(v)
            | ControlReply::Accepted(v)
            | ControlReply::Conflict(v)
            | ControlReply::Invalid(v)
            | ControlReply::Error(v) => v,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(control: Arc<ControlSurface>) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/count/:feed_id", get(count))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// 在阻塞线程池中执行控制操作 (打开视频源 / 等待停止都可能阻塞)
async fn blocking<F>(control: Arc<ControlSurface>, f: F) -> ControlReply
where
    F: FnOnce(&ControlSurface) -> ControlReply + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&control))
        .await
        .unwrap_or_else(|e| ControlReply::error(format!("control task failed: {}", e)))
}

async fn start(State(control): State<Arc<ControlSurface>>) -> ControlReply {
    blocking(control, |c| c.start()).await
}

async fn stop(State(control): State<Arc<ControlSurface>>) -> ControlReply {
    blocking(control, |c| c.stop()).await
}

/// 非数字 id 同样返回 400 `invalid id`
async fn count(
    State(control): State<Arc<ControlSurface>>,
    Path(feed_id): Path<String>,
) -> ControlReply {
    control.get_count(&feed_id)
}

async fn status(State(control): State<Arc<ControlSurface>>) -> ControlReply {
    control.status()
}

async fn healthz() -> &'static str {
    "ok"
}
