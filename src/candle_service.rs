use crate::{
    config::{Config, EngineConfig},
    engine::{EngineError, InferenceEngine, PredictionResult},
    model_service::{ModelService, ServiceError},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::instrument;

/// Runs the shared engine on the blocking pool. Classification is unbounded;
/// Grad-CAM passes hold a permit for as long as their blocking task runs.
#[derive(Clone)]
pub struct CandleModelService {
    engine: Arc<InferenceEngine>,
    explanation_permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl CandleModelService {
    pub fn new(engine: InferenceEngine, engine_cfg: &EngineConfig) -> Self {
        tracing::info!(
            "Model service ready, {} concurrent explanation(s), timeout {:?} ms",
            engine_cfg.max_concurrent_explanations,
            engine_cfg.inference_timeout_ms
        );
        Self {
            engine: Arc::new(engine),
            explanation_permits: Arc::new(Semaphore::new(
                engine_cfg.max_concurrent_explanations.max(1),
            )),
            timeout: engine_cfg.inference_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let engine = InferenceEngine::from_config(&config.model, &config.labels, &config.engine)?;
        Ok(Self::new(engine, &config.engine))
    }

    async fn run_blocking<T, F>(&self, task: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&InferenceEngine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = self.engine.clone();
        let handle = tokio::task::spawn_blocking(move || task(&engine));

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, handle)
                .await
                .map_err(|_| ServiceError::Timeout(limit.as_millis() as u64))?,
            None => handle.await,
        };

        let result =
            joined.map_err(|e| ServiceError::Internal(format!("inference task failed: {}", e)))?;
        Ok(result?)
    }
}

#[async_trait]
impl ModelService for CandleModelService {
    #[instrument(skip(self, image_data))]
    async fn predict(&self, image_data: Bytes) -> Result<PredictionResult, ServiceError> {
        self.run_blocking(move |engine| engine.predict(&image_data))
            .await
    }

    #[instrument(skip(self, image_data))]
    async fn explain(&self, image_data: Bytes) -> Result<Vec<u8>, ServiceError> {
        let permit = self
            .explanation_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ServiceError::Internal(format!("explanation gate closed: {}", e)))?;

        self.run_blocking(move |engine| {
            let _permit = permit;
            engine.explain(&image_data)
        })
        .await
    }
}
