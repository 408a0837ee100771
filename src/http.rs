//! HTTP surface: camera CRUD, live MJPEG streams, snapshots, status and
//! health. Registry writes are applied here and immediately propagated to the
//! stream manager so supervisors always reflect the stored records.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::GatewayError;
use crate::manager::StreamManager;
use crate::publisher::mjpeg_response;
use crate::registry::{CameraConfig, CameraRegistry, CameraUpdate, NewCamera};
use crate::supervisor::StreamStatus;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub registry: Arc<dyn CameraRegistry>,
    pub fps_limit: u32,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(err: &GatewayError) -> Response {
    match err {
        GatewayError::NotFound { camera_id } => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(
                &format!("Camera {} not found", camera_id),
                404,
            )),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<()>::error(&other.to_string(), 500)),
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/cameras", get(list_cameras).post(create_camera))
        .route(
            "/api/cameras/:id",
            get(get_camera).put(update_camera).delete(delete_camera),
        )
        .route("/api/cameras/:id/reconnect", post(reconnect_camera))
        .route("/api/stream/:id", get(stream_camera))
        .route("/api/snapshot/:id", get(snapshot_camera))
        .route("/api/status/:id", get(status_camera))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    active: bool,
}

/// Registry record merged with the live view from its supervisor, if any.
#[derive(Serialize)]
struct CameraView {
    #[serde(flatten)]
    camera: CameraConfig,
    connected: bool,
    fps: f32,
}

impl CameraView {
    fn merge(camera: CameraConfig, status: Option<&StreamStatus>) -> Self {
        Self {
            connected: status.map_or(false, |s| s.connected),
            fps: status.map_or(0.0, |s| s.fps),
            camera,
        }
    }
}

async fn list_cameras(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    match state.registry.list_cameras(query.active).await {
        Ok(cameras) => {
            let statuses = state.manager.statuses().await;
            let views: Vec<CameraView> = cameras
                .into_iter()
                .map(|c| {
                    let status = statuses.get(&c.id);
                    CameraView::merge(c, status)
                })
                .collect();
            Json(ApiResponse::success(views)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn create_camera(
    State(state): State<AppState>,
    Json(new_camera): Json<NewCamera>,
) -> Response {
    if new_camera.name.trim().is_empty() || new_camera.ip_address.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error("Name and IP address are required", 400)),
        )
            .into_response();
    }

    match state.registry.insert_camera(new_camera).await {
        Ok(camera) => {
            info!("Camera '{}' created with id {}", camera.name, camera.id);
            state.manager.on_camera_added(camera.clone()).await;
            (StatusCode::CREATED, Json(ApiResponse::success(camera))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn get_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.get_camera(id).await {
        Ok(Some(camera)) => {
            let status = state.manager.get_status(id).await.ok();
            Json(ApiResponse::success(CameraView::merge(camera, status.as_ref())))
                .into_response()
        }
        Ok(None) => error_response(&GatewayError::not_found(id)),
        Err(e) => error_response(&e),
    }
}

async fn update_camera(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<CameraUpdate>,
) -> Response {
    match state.registry.update_camera(id, update).await {
        Ok(Some(camera)) => {
            info!("Camera '{}' updated", camera.name);
            state.manager.on_camera_updated(camera.clone()).await;
            Json(ApiResponse::success(camera)).into_response()
        }
        Ok(None) => error_response(&GatewayError::not_found(id)),
        Err(e) => error_response(&e),
    }
}

async fn delete_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.deactivate_camera(id).await {
        Ok(true) => {
            state.manager.on_camera_removed(id).await;
            info!("Camera {} deactivated", id);
            Json(ApiResponse::success(serde_json::json!({
                "message": "Camera deactivated",
                "camera_id": id
            })))
            .into_response()
        }
        Ok(false) => error_response(&GatewayError::not_found(id)),
        Err(e) => error_response(&e),
    }
}

async fn reconnect_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.force_reconnect(id).await {
        Ok(()) => Json(ApiResponse::success(serde_json::json!({
            "message": "Reconnect requested",
            "camera_id": id
        })))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn stream_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.publisher(id).await {
        Ok((publisher, name)) => mjpeg_response(publisher, state.fps_limit, name),
        Err(e) => error_response(&e),
    }
}

async fn snapshot_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.snapshot(id).await {
        Ok(Some(jpeg)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            jpeg,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::error("No frame available yet", 503)),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn status_camera(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.get_status(id).await {
        Ok(status) => Json(ApiResponse::success(status)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    Json(state.manager.health().await).into_response()
}
