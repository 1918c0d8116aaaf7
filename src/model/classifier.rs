use super::{
    layers::{FeatureShape, Layer, LayerSpec},
    top_prediction, ModelError,
};
use candle_core::{DType, Device, IndexOp, Tensor, Var};
use candle_nn::VarBuilder;
use ndarray::{Array, Array3, Ix4};
use serde::Deserialize;
use std::{fs::File, io::BufReader, path::Path};

/// Layer graph of a sequential classifier. `input_shape` is height, width,
/// channels.
#[derive(Debug, Clone, Deserialize)]
pub struct Architecture {
    pub input_shape: [usize; 3],
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Activation map of one layer for a single image together with the gradient
/// of the top-1 class score with respect to it. Both are channels x height x
/// width.
#[derive(Debug, Clone)]
pub struct ActivationGradients {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
    pub predictions: Vec<f32>,
    pub class_index: usize,
}

/// Immutable feed-forward image classifier. Inputs are NHWC batches; the
/// layers run channels-first internally.
pub struct SequentialClassifier {
    layers: Vec<Layer>,
    input_shape: [usize; 3],
    num_classes: usize,
    device: Device,
}

impl SequentialClassifier {
    pub fn load(architecture_path: &Path, weights_path: &Path) -> Result<Self, ModelError> {
        let architecture = Architecture::from_file(architecture_path)?;
        let device = Device::Cpu;
        let tensors = candle_core::safetensors::load(weights_path, &device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let classifier = Self::from_architecture(architecture, vb)?;
        tracing::info!(
            "Loaded model with {} layers and {} classes",
            classifier.layers.len(),
            classifier.num_classes
        );
        Ok(classifier)
    }

    pub fn from_architecture(architecture: Architecture, vb: VarBuilder) -> Result<Self, ModelError> {
        let [height, width, channels] = architecture.input_shape;
        if height == 0 || width == 0 || channels == 0 {
            return Err(ModelError::InvalidArchitecture(format!(
                "input shape {:?} has an empty dimension",
                architecture.input_shape
            )));
        }

        let device = vb.device().clone();
        let mut shape = FeatureShape::Spatial {
            height,
            width,
            channels,
        };
        let mut layers = Vec::with_capacity(architecture.layers.len());
        for spec in architecture.layers {
            let (layer, output) = Layer::build(spec, shape, vb.clone())?;
            tracing::debug!("{} -> {:?}", layer.spec().name, output);
            layers.push(layer);
            shape = output;
        }

        let num_classes = match shape {
            FeatureShape::Flat(units) => units,
            FeatureShape::Spatial { .. } => {
                return Err(ModelError::InvalidArchitecture(
                    "model must end with a flat prediction vector".to_string(),
                ))
            }
        };

        Ok(Self {
            layers,
            input_shape: architecture.input_shape,
            num_classes,
            device,
        })
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter().map(Layer::spec)
    }

    /// Index of the deepest 2-D convolution, found by walking the layers
    /// backwards.
    pub fn last_conv_layer(&self) -> Result<usize, ModelError> {
        self.layers
            .iter()
            .rposition(|layer| layer.spec().is_conv2d())
            .ok_or(ModelError::NoConvolutionLayer)
    }

    /// Probability vector for the first (and only) image of the batch.
    pub fn forward(&self, input: &Array<f32, Ix4>) -> Result<Vec<f32>, ModelError> {
        let mut xs = self.to_tensor(input)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs.get(0)?.to_vec1::<f32>()?)
    }

    /// Runs the model split at `layer_index`: the activation of that layer is
    /// lifted into a variable, the remaining layers run on top of it and the
    /// top-1 class score is back-propagated to it. Weights are never touched.
    pub fn forward_with_gradients(
        &self,
        input: &Array<f32, Ix4>,
        layer_index: usize,
    ) -> Result<ActivationGradients, ModelError> {
        if layer_index >= self.layers.len() {
            return Err(ModelError::InvalidArchitecture(format!(
                "layer index {} out of range for {} layers",
                layer_index,
                self.layers.len()
            )));
        }

        let mut xs = self.to_tensor(input)?;
        for layer in &self.layers[..=layer_index] {
            xs = layer.forward(&xs)?;
        }
        let activation = Var::from_tensor(&xs)?;

        let mut head = activation.as_tensor().clone();
        for layer in &self.layers[layer_index + 1..] {
            head = layer.forward(&head)?;
        }

        let predictions = head.get(0)?.to_vec1::<f32>()?;
        let (class_index, _) = top_prediction(&predictions).ok_or(ModelError::EmptyPrediction)?;
        let class_score = head.i((0, class_index))?;

        let grads = class_score.backward()?;
        let gradient = match grads.get(activation.as_tensor()) {
            Some(gradient) => gradient.clone(),
            None => activation.as_tensor().zeros_like()?,
        };

        Ok(ActivationGradients {
            activations: first_image(activation.as_tensor())?,
            gradients: first_image(&gradient)?,
            predictions,
            class_index,
        })
    }

    fn to_tensor(&self, input: &Array<f32, Ix4>) -> Result<Tensor, ModelError> {
        let [height, width, channels] = self.input_shape;
        let shape = input.shape();
        if shape[0] == 0 || shape[1..] != [height, width, channels] {
            return Err(ModelError::InputShape {
                expected: vec![1, height, width, channels],
                actual: shape.to_vec(),
            });
        }

        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_vec(data, (shape[0], height, width, channels), &self.device)?;
        Ok(tensor.permute((0, 3, 1, 2))?.contiguous()?)
    }
}

fn first_image(tensor: &Tensor) -> Result<Array3<f32>, ModelError> {
    let (_, channels, height, width) = tensor.dims4()?;
    let data = tensor.get(0)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array3::from_shape_vec((channels, height, width), data)?)
}
