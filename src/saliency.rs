use crate::image_pipeline::RESIZE_FILTER;
use image::{codecs::jpeg::JpegEncoder, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3, Axis};
use thiserror::Error;

pub const ORIGINAL_WEIGHT: f64 = 0.6;
pub const HEATMAP_WEIGHT: f64 = 0.4;

#[derive(Error, Debug)]
pub enum SaliencyError {
    #[error("Activation shape {activations:?} does not match gradient shape {gradients:?}")]
    ShapeMismatch {
        activations: Vec<usize>,
        gradients: Vec<usize>,
    },
    #[error("Heat map of {width}x{height} cannot be resampled")]
    EmptyHeatmap { width: usize, height: usize },
    #[error("Could not encode GradCAM image: {0}")]
    Encoding(#[from] image::ImageError),
}

/// Grad-CAM heat map in [0, 1] from channels x height x width activations and
/// the matching gradients of the class score.
///
/// Channels are weighted by their spatially averaged gradient, summed, and
/// clamped at zero. A map with no positive evidence stays all zero instead of
/// being divided by its zero maximum.
pub fn class_activation_map(
    activations: &Array3<f32>,
    gradients: &Array3<f32>,
) -> Result<Array2<f32>, SaliencyError> {
    if activations.shape() != gradients.shape() {
        return Err(SaliencyError::ShapeMismatch {
            activations: activations.shape().to_vec(),
            gradients: gradients.shape().to_vec(),
        });
    }

    let (_, height, width) = activations.dim();
    if height == 0 || width == 0 {
        return Err(SaliencyError::EmptyHeatmap { width, height });
    }

    let spatial = (height * width) as f32;
    let weights = gradients.sum_axis(Axis(2)).sum_axis(Axis(1)) / spatial;

    let mut heatmap = Array2::<f32>::zeros((height, width));
    for (activation, weight) in activations.outer_iter().zip(weights.iter()) {
        heatmap.scaled_add(*weight, &activation);
    }

    // f32::max also maps NaN to zero.
    heatmap.mapv_inplace(|value| value.max(0.0));

    let max_value = heatmap.fold(0.0f32, |max, value| max.max(*value));
    if max_value > 0.0 {
        heatmap.mapv_inplace(|value| value / max_value);
    }

    Ok(heatmap)
}

/// Bilinear resize of a [0, 1] heat map to `width` x `height`.
pub fn resize_heatmap(
    heatmap: &Array2<f32>,
    width: u32,
    height: u32,
) -> Result<Array2<f32>, SaliencyError> {
    let (rows, cols) = heatmap.dim();
    let empty = || SaliencyError::EmptyHeatmap {
        width: cols,
        height: rows,
    };
    let data: Vec<f32> = heatmap.iter().copied().collect();
    let source: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(cols as u32, rows as u32, data).ok_or_else(empty)?;

    let resized = image::imageops::resize(&source, width, height, RESIZE_FILTER);

    Array2::from_shape_vec((height as usize, width as usize), resized.into_raw())
        .map_err(|_| empty())
}

/// Blue-to-red "jet" palette: 0 is dark blue, 255 is dark red.
pub fn jet(value: u8) -> Rgb<u8> {
    let v = value as f32 / 255.0;
    let channel =
        |center: f32| ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Maps each [0, 1] cell to [0, 255] (truncating) and through [`jet`].
pub fn colorize(heatmap: &Array2<f32>) -> RgbImage {
    let (rows, cols) = heatmap.dim();
    ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
        let intensity = (255.0 * heatmap[[y as usize, x as usize]]) as u8;
        jet(intensity)
    })
}

/// Per-pixel `0.6 * original + 0.4 * heat`, rounded and saturated.
pub fn blend(original: &RgbImage, heat: &RgbImage) -> RgbImage {
    ImageBuffer::from_fn(original.width(), original.height(), |x, y| {
        let a = original.get_pixel(x, y).0;
        let b = heat.get_pixel(x, y).0;
        Rgb(std::array::from_fn(|c| {
            (ORIGINAL_WEIGHT * a[c] as f64 + HEATMAP_WEIGHT * b[c] as f64)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    })
}

/// Stretches the heat map over the original image and blends the colourised
/// map on top of it.
pub fn render_overlay(
    original: &RgbImage,
    heatmap: &Array2<f32>,
) -> Result<RgbImage, SaliencyError> {
    let (width, height) = original.dimensions();
    let resized = resize_heatmap(heatmap, width, height)?;
    let heat = colorize(&resized);
    Ok(blend(original, &heat))
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, SaliencyError> {
    let mut buffer = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder.encode_image(image)?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{gradient_image, solid_image};
    use ndarray::{arr2, Array};

    #[test]
    fn test_class_activation_map() {
        let activations = Array::from_shape_vec(
            (2, 2, 2),
            vec![
                1.0, 2.0, 3.0, 4.0, // channel 0
                4.0, 3.0, 2.0, 1.0, // channel 1
            ],
        )
        .unwrap();
        let gradients = Array::from_shape_vec(
            (2, 2, 2),
            vec![
                1.0, 1.0, 1.0, 1.0, // channel 0
                -0.5, -0.5, -0.5, -0.5, // channel 1
            ],
        )
        .unwrap();

        let heatmap = class_activation_map(&activations, &gradients).unwrap();

        let expected = arr2(&[[0.0, 1.0 / 7.0], [4.0 / 7.0, 1.0]]);
        for (value, expected) in heatmap.iter().zip(expected.iter()) {
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_positive_evidence_gives_zero_map() {
        let activations = Array::from_elem((3, 4, 5), 2.0f32);
        let gradients = Array::from_elem((3, 4, 5), -1.0f32);

        let heatmap = class_activation_map(&activations, &gradients).unwrap();

        assert_eq!(heatmap.dim(), (4, 5));
        assert!(heatmap.iter().all(|value| *value == 0.0));

        let zero_gradients = Array::zeros((3, 4, 5));
        let heatmap = class_activation_map(&activations, &zero_gradients).unwrap();
        assert!(heatmap.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_shape_mismatch() {
        let activations = Array::zeros((2, 3, 3));
        let gradients = Array::zeros((2, 3, 4));

        assert!(matches!(
            class_activation_map(&activations, &gradients),
            Err(SaliencyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_resize_heatmap() {
        let heatmap = arr2(&[[0.0f32, 1.0], [0.5, 0.25]]);

        let resized = resize_heatmap(&heatmap, 50, 40).unwrap();

        assert_eq!(resized.dim(), (40, 50));
        assert!(resized.iter().all(|value| (0.0..=1.0).contains(value)));
    }

    #[test]
    fn test_jet_palette() {
        assert_eq!(jet(0).0, [0, 0, 128]);
        assert_eq!(jet(255).0, [128, 0, 0]);
        assert_eq!(jet(128).0[1], 255);
    }

    #[test]
    fn test_blend() {
        let original = solid_image(3, 2, [100, 0, 255]);
        let heat = solid_image(3, 2, [200, 255, 255]);

        let blended = blend(&original, &heat);

        assert_eq!(blended.get_pixel(2, 1).0, [140, 102, 255]);
    }

    #[test]
    fn test_zero_map_overlay_is_exact() {
        let original = gradient_image(37, 23);
        let heatmap = Array2::zeros((9, 9));

        let overlay = render_overlay(&original, &heatmap).unwrap();

        let cold = jet(0).0;
        for (x, y, pixel) in overlay.enumerate_pixels() {
            let source = original.get_pixel(x, y).0;
            for c in 0..3 {
                let expected = (0.6 * source[c] as f64 + 0.4 * cold[c] as f64).round() as u8;
                assert_eq!(pixel.0[c], expected);
            }
        }
    }

    #[test]
    fn test_encode_jpeg_keeps_dimensions() {
        let image = gradient_image(64, 48);

        let encoded = encode_jpeg(&image, 95).unwrap();

        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }
}
