use crate::model::{Architecture, SequentialClassifier};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::{ImageBuffer, Rgb, RgbImage};
use std::{collections::HashMap, io::Cursor};

pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    ImageBuffer::from_pixel(width, height, Rgb(color))
}

pub fn gradient_image(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    })
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut image_data: Vec<u8> = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Png)
        .unwrap();
    image_data
}

pub fn tiny_architecture() -> Architecture {
    serde_json::from_str(
        r#"{
            "input_shape": [71, 71, 3],
            "layers": [
                { "name": "conv1", "kind": "conv2d", "filters": 4, "kernel_size": 3, "padding": "same", "activation": "relu" },
                { "name": "conv2", "kind": "conv2d", "filters": 4, "kernel_size": 3, "padding": "same", "activation": "relu" },
                { "name": "gap", "kind": "global_average_pool2d" },
                { "name": "dropout", "kind": "dropout", "rate": 0.2 },
                { "name": "predictions", "kind": "dense", "units": 7, "activation": "softmax" }
            ]
        }"#,
    )
    .unwrap()
}

fn patterned(len: usize, modulus: usize, step: f32, offset: f32) -> Vec<f32> {
    (0..len)
        .map(|i| (i % modulus) as f32 * step - offset)
        .collect()
}

/// Deterministic weights for [`tiny_architecture`]. `conv_scale` multiplies
/// the second convolution; zero makes every activation of the last
/// convolution zero.
pub fn tiny_weights(conv_scale: f32) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let tensor = |data: Vec<f32>, shape: &[usize]| Tensor::from_vec(data, shape, &device).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert(
        "conv1.weight".to_string(),
        tensor(patterned(4 * 3 * 3 * 3, 7, 0.05, 0.1), &[4, 3, 3, 3]),
    );
    tensors.insert("conv1.bias".to_string(), tensor(vec![0.05; 4], &[4]));
    tensors.insert(
        "conv2.weight".to_string(),
        tensor(
            patterned(4 * 4 * 3 * 3, 5, 0.04, 0.06)
                .into_iter()
                .map(|w| w * conv_scale)
                .collect(),
            &[4, 4, 3, 3],
        ),
    );
    tensors.insert(
        "conv2.bias".to_string(),
        tensor(vec![0.01 * conv_scale; 4], &[4]),
    );
    tensors.insert(
        "predictions.weight".to_string(),
        tensor(patterned(7 * 4, 5, 0.3, 0.6), &[7, 4]),
    );
    tensors.insert(
        "predictions.bias".to_string(),
        tensor(patterned(7, 7, 0.01, 0.0), &[7]),
    );
    tensors
}

pub fn tiny_classifier(conv_scale: f32) -> SequentialClassifier {
    let device = Device::Cpu;
    let vb = VarBuilder::from_tensors(tiny_weights(conv_scale), DType::F32, &device);
    SequentialClassifier::from_architecture(tiny_architecture(), vb).unwrap()
}

pub fn class_labels() -> crate::labels::ClassLabels {
    crate::labels::ClassLabels::new(
        ["nv", "mel", "bkl", "bcc", "akiec", "vasc", "df"]
            .iter()
            .map(|label| label.to_string())
            .collect(),
    )
    .unwrap()
}

pub fn tiny_engine(conv_scale: f32) -> crate::engine::InferenceEngine {
    crate::engine::InferenceEngine::new(
        tiny_classifier(conv_scale),
        class_labels(),
        crate::config::ChannelOrder::Bgr,
        95,
    )
    .unwrap()
}
