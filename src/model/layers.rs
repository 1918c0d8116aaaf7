use super::ModelError;
use candle_core::{Module, Tensor, D};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Softmax,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Linear => Ok(xs.clone()),
            Activation::Relu => xs.relu(),
            Activation::Sigmoid => (xs.neg()?.exp()? + 1.0)?.recip(),
            Activation::Softmax => {
                // Channels sit on dim 1 while features are still spatial (NCHW).
                if xs.rank() == 4 {
                    candle_nn::ops::softmax(xs, 1)
                } else {
                    candle_nn::ops::softmax(xs, D::Minus1)
                }
            }
        }
    }
}

fn default_strides() -> usize {
    1
}

fn default_use_bias() -> bool {
    true
}

fn default_bn_epsilon() -> f64 {
    1e-3
}

/// What a layer does, as written in the architecture file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_strides")]
        strides: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
        #[serde(default = "default_use_bias")]
        use_bias: bool,
    },
    BatchNorm {
        #[serde(default = "default_bn_epsilon")]
        epsilon: f64,
    },
    Activation {
        activation: Activation,
    },
    MaxPool2d {
        pool_size: usize,
        #[serde(default)]
        strides: Option<usize>,
    },
    GlobalAveragePool2d,
    Flatten,
    Dropout {
        #[serde(default)]
        rate: f32,
    },
    Dense {
        units: usize,
        #[serde(default)]
        activation: Activation,
        #[serde(default = "default_use_bias")]
        use_bias: bool,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

impl LayerSpec {
    pub fn is_conv2d(&self) -> bool {
        matches!(self.kind, LayerKind::Conv2d { .. })
    }
}

/// Per-sample feature shape flowing between layers, used to size weights and
/// reject architectures whose layers do not chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureShape {
    Spatial {
        height: usize,
        width: usize,
        channels: usize,
    },
    Flat(usize),
}

/// Zero padding applied around the spatial dims before a convolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ZeroPad {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

impl ZeroPad {
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if *self == Self::default() {
            return Ok(xs.clone());
        }
        xs.pad_with_zeros(2, self.top, self.bottom)?
            .pad_with_zeros(3, self.left, self.right)
    }
}

/// `same` padding along one axis: the output keeps `ceil(size / stride)`
/// positions and any odd leftover goes to the trailing edge.
fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = size.div_ceil(stride);
    let total = ((output - 1) * stride + kernel).saturating_sub(size);
    (total / 2, total - total / 2)
}

enum Op {
    Conv2d { conv: Conv2d, pad: ZeroPad },
    BatchNorm(BatchNorm),
    MaxPool2d { kernel: usize, stride: usize },
    GlobalAveragePool2d,
    Flatten,
    Identity,
    Dense(Linear),
}

pub struct Layer {
    spec: LayerSpec,
    op: Op,
    activation: Activation,
}

impl Layer {
    /// Builds the layer from weights under `<name>.*` and returns it with its
    /// output shape.
    ///
    /// Weights use candle's layouts, not the channels-last ones Keras saves:
    /// - `conv2d`: `<name>.weight` is `(filters, in_channels, kh, kw)` (OIHW,
    ///   transpose a Keras HWIO kernel with axes `(3, 2, 0, 1)`), `<name>.bias`
    ///   is `(filters,)`;
    /// - `dense`: `<name>.weight` is `(units, in_features)`, the transpose of a
    ///   Keras kernel, `<name>.bias` is `(units,)`;
    /// - `batch_norm`: `<name>.weight` (gamma), `<name>.bias` (beta),
    ///   `<name>.running_mean` and `<name>.running_var`, all `(channels,)`.
    ///
    /// Dense input features after a `flatten` are ordered height, width,
    /// channels, so Keras dense kernels need no reordering beyond the
    /// transpose.
    pub fn build(
        spec: LayerSpec,
        input: FeatureShape,
        vb: VarBuilder,
    ) -> Result<(Self, FeatureShape), ModelError> {
        let vb = vb.pp(&spec.name);
        let invalid = |reason: &str| {
            ModelError::InvalidArchitecture(format!("layer `{}`: {}", spec.name, reason))
        };

        let (op, activation, output) = match (&spec.kind, input) {
            (
                LayerKind::Conv2d {
                    filters,
                    kernel_size,
                    strides,
                    padding,
                    activation,
                    use_bias,
                },
                FeatureShape::Spatial {
                    height,
                    width,
                    channels,
                },
            ) => {
                let (kernel, stride) = (*kernel_size, *strides);
                if kernel == 0 || stride == 0 || *filters == 0 {
                    return Err(invalid("filters, kernel_size and strides must be positive"));
                }
                let (pad, output_height, output_width) = match padding {
                    Padding::Valid => {
                        if height < kernel || width < kernel {
                            return Err(invalid("kernel is larger than its input"));
                        }
                        (
                            ZeroPad::default(),
                            (height - kernel) / stride + 1,
                            (width - kernel) / stride + 1,
                        )
                    }
                    Padding::Same => {
                        let (top, bottom) = same_padding(height, kernel, stride);
                        let (left, right) = same_padding(width, kernel, stride);
                        (
                            ZeroPad {
                                top,
                                bottom,
                                left,
                                right,
                            },
                            height.div_ceil(stride),
                            width.div_ceil(stride),
                        )
                    }
                };
                let cfg = Conv2dConfig {
                    stride,
                    ..Default::default()
                };
                let conv = if *use_bias {
                    candle_nn::conv2d(channels, *filters, kernel, cfg, vb)?
                } else {
                    candle_nn::conv2d_no_bias(channels, *filters, kernel, cfg, vb)?
                };
                let output = FeatureShape::Spatial {
                    height: output_height,
                    width: output_width,
                    channels: *filters,
                };
                (Op::Conv2d { conv, pad }, *activation, output)
            }
            (LayerKind::BatchNorm { epsilon }, FeatureShape::Spatial { channels, .. })
            | (LayerKind::BatchNorm { epsilon }, FeatureShape::Flat(channels)) => {
                let cfg = BatchNormConfig {
                    eps: *epsilon,
                    ..Default::default()
                };
                let bn = candle_nn::batch_norm(channels, cfg, vb)?;
                (Op::BatchNorm(bn), Activation::Linear, input)
            }
            (LayerKind::Activation { activation }, _) => (Op::Identity, *activation, input),
            (
                LayerKind::MaxPool2d { pool_size, strides },
                FeatureShape::Spatial {
                    height,
                    width,
                    channels,
                },
            ) => {
                let kernel = *pool_size;
                let stride = strides.unwrap_or(kernel);
                if kernel == 0 || stride == 0 {
                    return Err(invalid("pool_size and strides must be positive"));
                }
                if height < kernel || width < kernel {
                    return Err(invalid("pool window is larger than its input"));
                }
                let output = FeatureShape::Spatial {
                    height: (height - kernel) / stride + 1,
                    width: (width - kernel) / stride + 1,
                    channels,
                };
                (Op::MaxPool2d { kernel, stride }, Activation::Linear, output)
            }
            (LayerKind::GlobalAveragePool2d, FeatureShape::Spatial { channels, .. }) => (
                Op::GlobalAveragePool2d,
                Activation::Linear,
                FeatureShape::Flat(channels),
            ),
            (
                LayerKind::Flatten,
                FeatureShape::Spatial {
                    height,
                    width,
                    channels,
                },
            ) => (
                Op::Flatten,
                Activation::Linear,
                FeatureShape::Flat(height * width * channels),
            ),
            (LayerKind::Flatten, FeatureShape::Flat(_)) | (LayerKind::Dropout { .. }, _) => {
                (Op::Identity, Activation::Linear, input)
            }
            (
                LayerKind::Dense {
                    units,
                    activation,
                    use_bias,
                },
                FeatureShape::Flat(features),
            ) => {
                if *units == 0 {
                    return Err(invalid("units must be positive"));
                }
                let linear = if *use_bias {
                    candle_nn::linear(features, *units, vb)?
                } else {
                    candle_nn::linear_no_bias(features, *units, vb)?
                };
                (Op::Dense(linear), *activation, FeatureShape::Flat(*units))
            }
            (LayerKind::Dense { .. }, FeatureShape::Spatial { .. }) => {
                return Err(invalid("dense layers need flat input, add a flatten or pooling layer"))
            }
            (_, FeatureShape::Flat(_)) => {
                return Err(invalid("spatial layer placed after the features were flattened"))
            }
        };

        Ok((
            Self {
                spec,
                op,
                activation,
            },
            output,
        ))
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    /// Inference-mode forward pass on an NCHW (or N x features) tensor.
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = match &self.op {
            Op::Conv2d { conv, pad } => conv.forward(&pad.apply(xs)?)?,
            Op::BatchNorm(bn) => xs.apply_t(bn, false)?,
            Op::MaxPool2d { kernel, stride } => xs.max_pool2d_with_stride(*kernel, *stride)?,
            Op::GlobalAveragePool2d => xs.mean((2, 3))?,
            // Flatten in HWC order so dense weights exported from channels-last
            // frameworks line up.
            Op::Flatten => xs.permute((0, 2, 3, 1))?.flatten_from(1)?,
            Op::Identity => xs.clone(),
            Op::Dense(linear) => linear.forward(xs)?,
        };
        self.activation.apply(&ys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    #[test]
    fn test_layer_spec_from_json() {
        let spec: LayerSpec = serde_json::from_str(
            r#"{ "name": "conv", "kind": "conv2d", "filters": 8, "kernel_size": 3, "padding": "same", "activation": "relu" }"#,
        )
        .unwrap();

        assert_eq!(spec.name, "conv");
        assert!(spec.is_conv2d());
        assert_eq!(
            spec.kind,
            LayerKind::Conv2d {
                filters: 8,
                kernel_size: 3,
                strides: 1,
                padding: Padding::Same,
                activation: Activation::Relu,
                use_bias: true,
            }
        );

        let pool: LayerSpec =
            serde_json::from_str(r#"{ "name": "gap", "kind": "global_average_pool2d" }"#).unwrap();
        assert!(!pool.is_conv2d());
    }

    #[test]
    fn test_conv_output_shape() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv.weight".to_string(),
            Tensor::zeros((4, 3, 3, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "conv.bias".to_string(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let spec = LayerSpec {
            name: "conv".to_string(),
            kind: LayerKind::Conv2d {
                filters: 4,
                kernel_size: 3,
                strides: 2,
                padding: Padding::Valid,
                activation: Activation::Relu,
                use_bias: true,
            },
        };
        let input = FeatureShape::Spatial {
            height: 71,
            width: 71,
            channels: 3,
        };

        let (layer, output) = Layer::build(spec, input, vb).unwrap();

        assert_eq!(
            output,
            FeatureShape::Spatial {
                height: 35,
                width: 35,
                channels: 4
            }
        );
        let xs = Tensor::ones((1, 3, 71, 71), DType::F32, &device).unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 4, 35, 35]);
    }

    #[test]
    fn test_same_padding_splits_like_keras() {
        assert_eq!(same_padding(71, 3, 1), (1, 1));
        assert_eq!(same_padding(71, 3, 2), (1, 1));
        assert_eq!(same_padding(4, 2, 1), (0, 1));
        assert_eq!(same_padding(8, 2, 2), (0, 0));
        assert_eq!(same_padding(7, 4, 2), (1, 2));
    }

    #[test]
    fn test_same_padding_with_stride_and_even_kernel() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv.weight".to_string(),
            Tensor::ones((2, 1, 2, 2), DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let spec = LayerSpec {
            name: "conv".to_string(),
            kind: LayerKind::Conv2d {
                filters: 2,
                kernel_size: 2,
                strides: 2,
                padding: Padding::Same,
                activation: Activation::Linear,
                use_bias: false,
            },
        };
        let input = FeatureShape::Spatial {
            height: 3,
            width: 5,
            channels: 1,
        };

        let (layer, output) = Layer::build(spec, input, vb).unwrap();

        assert_eq!(
            output,
            FeatureShape::Spatial {
                height: 2,
                width: 3,
                channels: 2
            }
        );
        let xs = Tensor::ones((1, 1, 3, 5), DType::F32, &device).unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[1, 2, 2, 3]);
        // Padding lands on the bottom and right edges only, so the top-left
        // window is fully inside the image and the bottom-right one is not.
        let first = ys.get(0).unwrap().get(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first, vec![vec![4., 4., 2.], vec![2., 2., 1.]]);
    }

    #[test]
    fn test_dense_after_spatial_is_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &device);
        let spec = LayerSpec {
            name: "fc".to_string(),
            kind: LayerKind::Dense {
                units: 7,
                activation: Activation::Softmax,
                use_bias: true,
            },
        };
        let input = FeatureShape::Spatial {
            height: 4,
            width: 4,
            channels: 2,
        };

        assert!(matches!(
            Layer::build(spec, input, vb),
            Err(ModelError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_flatten_uses_channels_last_order() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &device);
        let spec = LayerSpec {
            name: "flatten".to_string(),
            kind: LayerKind::Flatten,
        };
        let input = FeatureShape::Spatial {
            height: 1,
            width: 2,
            channels: 2,
        };
        let (layer, output) = Layer::build(spec, input, vb).unwrap();
        assert_eq!(output, FeatureShape::Flat(4));

        // NCHW [[c0: 1, 2], [c1: 3, 4]] flattens to HWC [1, 3, 2, 4].
        let xs = Tensor::new(&[1f32, 2., 3., 4.], &device)
            .unwrap()
            .reshape((1, 2, 1, 2))
            .unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(ys.to_vec2::<f32>().unwrap(), vec![vec![1., 3., 2., 4.]]);
    }

    #[test]
    fn test_softmax_activation_sums_to_one() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[1f32, 2., 3.]], &device).unwrap();
        let ys = Activation::Softmax.apply(&xs).unwrap();
        let total: f32 = ys.to_vec2::<f32>().unwrap()[0].iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
