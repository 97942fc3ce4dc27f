use axum::extract::rejection::PathRejection;
use axum::extract::{path, FromRequestParts};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;

use crate::app_state::AppState;
use crate::error::AppError;

pub mod downloads;

/// `Path` extractor wrapper that maps deserialization failures onto `AppError` instead
/// of axum's opaque default rejection body.
pub struct Path<T>(pub T);

impl<S, T> FromRequestParts<S> for Path<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Path::<T>::from_request_parts(parts, state).await {
            Ok(value) => Ok(Self(value.0)),
            Err(rejection) => {
                let error = match rejection {
                    PathRejection::FailedToDeserializePathParams(inner) => {
                        let kind = inner.into_kind();
                        match &kind {
                            path::ErrorKind::Message(msg) => AppError::bad_request(msg.clone()),
                            path::ErrorKind::UnsupportedType { .. } => AppError::internal_error(kind.to_string()),
                            _ => AppError::bad_request(kind.to_string()),
                        }
                    }
                    PathRejection::MissingPathParams(error) => AppError::internal_error(error.to_string()),
                    _ => AppError::internal_error(format!("unhandled path rejection: {rejection}")),
                };
                Err(error)
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/downloads", post(downloads::create_download).get(downloads::list_downloads))
        .route("/api/downloads/{id}", get(downloads::get_download).delete(downloads::cancel_download))
        .route("/api/downloads/{id}/pause", post(downloads::pause_download))
        .route("/api/downloads/{id}/resume", post(downloads::resume_download))
        .route("/api/downloads/events", get(crate::ws::ws))
        .route("/api/log", get(crate::tracing::LogChannel::into_sse_stream))
        .layer(Extension(state.log_channel.clone()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
