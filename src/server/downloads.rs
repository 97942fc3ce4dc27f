//! HTTP handlers for the downloads admin surface.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::error::AppError;
use crate::model::Task;

use super::Path;

#[derive(Debug, Deserialize)]
pub struct CreateDownloadRequest {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateDownloadResponse {
    pub id: String,
}

pub async fn create_download(
    State(state): State<AppState>,
    Json(request): Json<CreateDownloadRequest>,
) -> Result<Json<CreateDownloadResponse>, AppError> {
    if request.url.trim().is_empty() {
        return Err(AppError::bad_request("url must not be empty"));
    }
    let title = request.title.unwrap_or_else(|| request.url.clone());
    let id = state
        .scheduler
        .add(request.url, title, request.key, request.iv)
        .await;
    Ok(Json(CreateDownloadResponse { id }))
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.scheduler.list().await)
}

pub async fn get_download(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, AppError> {
    state
        .scheduler
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no download with id {id}")))
}

pub async fn pause_download(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.scheduler.pause(&id).await;
    StatusCode::NO_CONTENT
}

pub async fn resume_download(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.scheduler.resume(&id).await;
    StatusCode::NO_CONTENT
}

pub async fn cancel_download(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.scheduler.cancel(&id).await;
    StatusCode::NO_CONTENT
}
