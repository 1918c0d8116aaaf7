use crate::model_service::ServiceError;
use axum::{
    extract::{multipart::MultipartRejection, Multipart},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

/// Form field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No image file provided")]
    MissingInput,
    #[error("Failed to read upload: {message}")]
    Upload { status: StatusCode, message: String },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingInput => StatusCode::BAD_REQUEST,
            ApiError::Upload { status, .. } => *status,
            ApiError::Service(ServiceError::InvalidImage(_)) => StatusCode::BAD_REQUEST,
            ApiError::Service(ServiceError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Service(ServiceError::Encoding(_))
            | ApiError::Service(ServiceError::Internal(_))
            | ApiError::HttpBuilder(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::MissingInput => "missing_input",
            ApiError::Upload { .. } => "upload",
            ApiError::Service(ServiceError::InvalidImage(_)) => "invalid_image",
            ApiError::Service(ServiceError::Encoding(_)) => "encoding",
            ApiError::Service(ServiceError::Timeout(_)) => "timeout",
            ApiError::Service(ServiceError::Internal(_)) => "internal",
            ApiError::HttpBuilder(_) => "http_builder",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Rejected request: {}", self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Pulls the `image` part out of a multipart upload. A request that is not
/// multipart at all counts as a missing image.
pub async fn read_image_field(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Bytes, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Request is not a multipart upload: {}", e);
        ApiError::MissingInput
    })?;

    let upload_error = |e: axum::extract::multipart::MultipartError| ApiError::Upload {
        status: e.status(),
        message: e.body_text(),
    };

    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() == Some(IMAGE_FIELD) {
            return field.bytes().await.map_err(upload_error);
        }
    }

    Err(ApiError::MissingInput)
}
