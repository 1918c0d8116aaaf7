use crate::engine::{EngineError, PredictionResult};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidImage(String),
    #[error("{0}")]
    Encoding(String),
    #[error("Inference timed out after {0} ms")]
    Timeout(u64),
    #[error("Inference failed: {0}")]
    Internal(String),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidImage(_) => ServiceError::InvalidImage(err.to_string()),
            EngineError::Encoding(_) => ServiceError::Encoding(err.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn predict(&self, image_data: Bytes) -> Result<PredictionResult, ServiceError>;
    async fn explain(&self, image_data: Bytes) -> Result<Vec<u8>, ServiceError>;
}
