use super::error::{read_image_field, ApiError};
use crate::{engine::PredictionResult, model_service::ModelService, server::SharedState};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/predict";

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    state.metrics.record_request(ROUTE);

    let result = classify(&state, multipart).await;
    if let Err(err) = &result {
        state.metrics.record_error(ROUTE, err.kind());
    }

    result.map(Json)
}

async fn classify<M: ModelService>(
    state: &SharedState<M>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<PredictionResult, ApiError> {
    let image_data = read_image_field(multipart).await?;

    let started = Instant::now();
    let result = state.model_service.predict(image_data).await?;
    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, ROUTE);

    tracing::info!(
        "Predicted class={} index={} confidence={:.2}",
        result.predicted_class,
        result.class_index,
        result.confidence
    );

    Ok(result)
}
