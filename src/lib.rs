mod candle_service;
mod routes;
mod server;
mod telemetry;

#[cfg(test)]
mod test_utils;

pub mod app;
pub mod config;
pub mod engine;
pub mod image_pipeline;
pub mod labels;
pub mod model;
pub mod model_service;
pub mod saliency;

pub use app::start_app;
pub use candle_service::CandleModelService;
