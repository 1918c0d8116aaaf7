use super::error::{read_image_field, ApiError};
use crate::{model_service::ModelService, server::SharedState};
use axum::{
    body::Body,
    extract::{multipart::MultipartRejection, Multipart, State},
    http::header,
    response::Response,
};
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/gradcam";

#[instrument(skip(state, multipart))]
pub async fn gradcam<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    state.metrics.record_request(ROUTE);

    let result = explain(&state, multipart).await;
    if let Err(err) = &result {
        state.metrics.record_error(ROUTE, err.kind());
    }

    result
}

async fn explain<M: ModelService>(
    state: &SharedState<M>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let image_data = read_image_field(multipart).await?;

    let started = Instant::now();
    let overlay = state.model_service.explain(image_data).await?;
    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, ROUTE);

    tracing::debug!("Returning {} byte GradCAM overlay", overlay.len());

    Response::builder()
        .header(header::CONTENT_TYPE, "image/jpeg")
        .body(Body::from(overlay))
        .map_err(|e| ApiError::HttpBuilder(e.to_string()))
}
