use crate::{
    config::{ChannelOrder, EngineConfig, LabelsConfig, ModelConfig},
    image_pipeline::{ImagePipeline, ImagePipelineError, PreprocessedImage},
    labels::ClassLabels,
    model::{top_prediction, ModelError, SequentialClassifier},
    saliency::{self, SaliencyError},
};
use image::RgbImage;
use ndarray::{Array, Array2, Ix4};
use serde::{ser::SerializeMap, Serialize, Serializer};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    InvalidImage(#[from] ImagePipelineError),
    #[error("No Conv2D layer found in model")]
    NoConvolutionLayer,
    #[error("Model predicts {outputs} classes but {labels} labels are configured")]
    LabelCountMismatch { outputs: usize, labels: usize },
    #[error("Model expects {channels} input channels, only 3-channel images are supported")]
    UnsupportedInput { channels: usize },
    #[error("{0}")]
    Labels(String),
    #[error("Inference failed: {0}")]
    Model(#[from] ModelError),
    #[error("Could not encode GradCAM image: {0}")]
    Encoding(image::ImageError),
    #[error("Saliency computation failed: {0}")]
    Saliency(SaliencyError),
}

impl From<SaliencyError> for EngineError {
    fn from(err: SaliencyError) -> Self {
        match err {
            SaliencyError::Encoding(e) => EngineError::Encoding(e),
            other => EngineError::Saliency(other),
        }
    }
}

/// Label -> percentage, serialised as a JSON object in label-set order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassConfidences(Vec<(String, f64)>);

impl ClassConfidences {
    pub fn new(confidences: Vec<(String, f64)>) -> Self {
        Self(confidences)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, confidence)| *confidence)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl Serialize for ClassConfidences {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, confidence) in &self.0 {
            map.serialize_entry(label, confidence)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f64,
    pub class_index: usize,
    pub all_class_confidences: ClassConfidences,
}

impl PredictionResult {
    /// Top-1 answer plus every class as a percentage rounded to 2 decimals.
    /// Never rejects low-confidence vectors.
    pub fn from_probabilities(
        probabilities: &[f32],
        labels: &ClassLabels,
    ) -> Result<Self, EngineError> {
        if probabilities.len() != labels.len() {
            return Err(EngineError::LabelCountMismatch {
                outputs: probabilities.len(),
                labels: labels.len(),
            });
        }
        let (class_index, confidence) =
            top_prediction(probabilities).ok_or(ModelError::EmptyPrediction)?;

        let all_class_confidences = ClassConfidences(
            labels
                .iter()
                .zip(probabilities)
                .map(|(label, p)| (label.to_string(), to_percentage(*p)))
                .collect(),
        );

        Ok(Self {
            predicted_class: labels.get(class_index).unwrap_or_default().to_string(),
            confidence: to_percentage(confidence),
            class_index,
            all_class_confidences,
        })
    }
}

fn to_percentage(probability: f32) -> f64 {
    (probability as f64 * 100.0 * 100.0).round() / 100.0
}

/// Process-wide classifier and explainer. Built once at startup and shared
/// read-only by every request.
pub struct InferenceEngine {
    model: SequentialClassifier,
    labels: ClassLabels,
    pipeline: ImagePipeline,
    last_conv_layer: usize,
    jpeg_quality: u8,
}

impl InferenceEngine {
    pub fn new(
        model: SequentialClassifier,
        labels: ClassLabels,
        channel_order: ChannelOrder,
        jpeg_quality: u8,
    ) -> Result<Self, EngineError> {
        let last_conv_layer = model.last_conv_layer().map_err(|err| match err {
            ModelError::NoConvolutionLayer => EngineError::NoConvolutionLayer,
            other => EngineError::Model(other),
        })?;

        if model.num_classes() != labels.len() {
            return Err(EngineError::LabelCountMismatch {
                outputs: model.num_classes(),
                labels: labels.len(),
            });
        }

        let [height, width, channels] = model.input_shape();
        if channels != 3 {
            return Err(EngineError::UnsupportedInput { channels });
        }

        if let Some(layer) = model.descriptors().nth(last_conv_layer) {
            tracing::info!("Using layer `{}` for GradCAM", layer.name);
        }

        Ok(Self {
            model,
            labels,
            pipeline: ImagePipeline::new(width as u32, height as u32, channel_order),
            last_conv_layer,
            jpeg_quality,
        })
    }

    pub fn from_config(
        model_cfg: &ModelConfig,
        labels_cfg: &LabelsConfig,
        engine_cfg: &EngineConfig,
    ) -> Result<Self, EngineError> {
        tracing::info!(
            "Loading model from {:?}",
            model_cfg.get_architecture_path()
        );
        let model = SequentialClassifier::load(
            &model_cfg.get_architecture_path(),
            &model_cfg.get_weights_path(),
        )?;
        let labels = ClassLabels::from_config(labels_cfg).map_err(EngineError::Labels)?;

        Self::new(
            model,
            labels,
            model_cfg.channel_order,
            engine_cfg.jpeg_quality,
        )
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    pub fn preprocess(&self, image_data: &[u8]) -> Result<PreprocessedImage, EngineError> {
        Ok(self.pipeline.process(image_data)?)
    }

    pub fn classify(&self, tensor: &Array<f32, Ix4>) -> Result<PredictionResult, EngineError> {
        let probabilities = self.model.forward(tensor)?;
        PredictionResult::from_probabilities(&probabilities, &self.labels)
    }

    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub fn predict(&self, image_data: &[u8]) -> Result<PredictionResult, EngineError> {
        let preprocessed = self.preprocess(image_data)?;
        let result = self.classify(&preprocessed.tensor)?;
        tracing::debug!(
            "Predicted {} ({:.2}%)",
            result.predicted_class,
            result.confidence
        );
        Ok(result)
    }

    /// Grad-CAM map at the resolution of the last convolution, and the class
    /// it explains.
    pub fn heatmap(&self, tensor: &Array<f32, Ix4>) -> Result<(Array2<f32>, usize), EngineError> {
        let captured = self
            .model
            .forward_with_gradients(tensor, self.last_conv_layer)?;
        let heatmap = saliency::class_activation_map(&captured.activations, &captured.gradients)?;
        Ok((heatmap, captured.class_index))
    }

    /// Overlay at the original resolution, before encoding.
    pub fn render_explanation(
        &self,
        preprocessed: &PreprocessedImage,
    ) -> Result<RgbImage, EngineError> {
        let (heatmap, class_index) = self.heatmap(&preprocessed.tensor)?;
        tracing::debug!(
            "GradCAM for class {} on {:?}",
            self.labels.get(class_index).unwrap_or("unknown"),
            preprocessed.original.dimensions()
        );
        Ok(saliency::render_overlay(&preprocessed.original, &heatmap)?)
    }

    /// JPEG bytes of the heat map blended over the submitted image.
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub fn explain(&self, image_data: &[u8]) -> Result<Vec<u8>, EngineError> {
        let preprocessed = self.preprocess(image_data)?;
        let overlay = self.render_explanation(&preprocessed)?;
        Ok(saliency::encode_jpeg(&overlay, self.jpeg_quality)?)
    }
}
