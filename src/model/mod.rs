mod classifier;
mod layers;

pub use classifier::{ActivationGradients, Architecture, SequentialClassifier};
pub use layers::{Activation, FeatureShape, LayerKind, LayerSpec, Padding};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed architecture file: {0}")]
    Architecture(#[from] serde_json::Error),
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error("No Conv2D layer found in model")]
    NoConvolutionLayer,
    #[error("Unexpected input shape {actual:?}, expected {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("Invalid tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Model produced an empty prediction vector")]
    EmptyPrediction,
}

/// Index and value of the largest entry; ties resolve to the first index.
pub fn top_prediction(probabilities: &[f32]) -> Option<(usize, f32)> {
    probabilities
        .iter()
        .enumerate()
        .map(|(index, value)| (index, *value))
        .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
}
