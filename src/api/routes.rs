use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::remote::{deserialize_exam_id, ExamId};

use super::{preview, ApiState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExamRequest {
    pub token: String,
    #[serde(deserialize_with = "deserialize_exam_id")]
    pub exam_id: ExamId,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/login_and_start_exam", post(login_and_start_exam))
        .route("/stop_exam", get(stop_exam))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/video_stream", get(preview::video_stream))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn login_and_start_exam(
    State(state): State<ApiState>,
    Json(request): Json<StartExamRequest>,
) -> impl IntoResponse {
    let success = match state
        .coordinator
        .login_and_start_exam(&request.token, request.exam_id)
        .await
    {
        Ok(generation) => {
            log::info!("exam {} running as generation {generation}", request.exam_id);
            true
        }
        Err(err) => {
            log::warn!("could not start exam {}: {err}", request.exam_id);
            false
        }
    };
    Json(json!({ "success": success }))
}

async fn stop_exam(State(state): State<ApiState>) -> impl IntoResponse {
    let stopped = state.coordinator.stop_exam().await;
    if !stopped {
        log::debug!("stop_exam with no exam running");
    }
    Json(json!({ "success": true }))
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.coordinator.status().await)
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let broadcaster = state.coordinator.broadcaster();
    Json(json!({
        "pipeline": state.coordinator.metrics().snapshot(),
        "framesPublished": broadcaster.published(),
        "framesDropped": broadcaster.total_dropped(),
    }))
}
