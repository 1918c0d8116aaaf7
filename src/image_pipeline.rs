use crate::config::ChannelOrder;
use image::{
    imageops::FilterType, metadata::Orientation, DynamicImage, ImageDecoder, RgbImage,
};
use ndarray::{Array, Ix4};
use thiserror::Error;

/// Side length of the square input the classifier was trained on.
pub const INPUT_SIZE: u32 = 71;

/// Bilinear, matching the resize used when the model was trained.
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Error, Debug)]
pub enum ImagePipelineError {
    #[error("Invalid image file: {0}")]
    InvalidImage(String),
}

/// Model-ready NHWC tensor plus the decoded image at its native resolution.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub tensor: Array<f32, Ix4>,
    pub original: RgbImage,
}

#[derive(Debug, Clone, Copy)]
pub struct ImagePipeline {
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
}

impl ImagePipeline {
    pub fn new(width: u32, height: u32, channel_order: ChannelOrder) -> Self {
        Self {
            width,
            height,
            channel_order,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn process(&self, image_data: &[u8]) -> Result<PreprocessedImage, ImagePipelineError> {
        let original = decode_color(image_data)?;

        // Stretched, not cropped; aspect ratio is not preserved.
        let resized = image::imageops::resize(&original, self.width, self.height, RESIZE_FILTER);

        let mut tensor = Array::zeros((1, self.height as usize, self.width as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let channels = match self.channel_order {
                ChannelOrder::Bgr => [b, g, r],
                ChannelOrder::Rgb => [r, g, b],
            };
            for (c, value) in channels.into_iter().enumerate() {
                tensor[[0, y as usize, x as usize, c]] = (value as f32) / 255.;
            }
        }

        Ok(PreprocessedImage { tensor, original })
    }
}

impl Default for ImagePipeline {
    fn default() -> Self {
        Self::new(INPUT_SIZE, INPUT_SIZE, ChannelOrder::default())
    }
}

/// Decodes any supported format into three 8-bit channels; alpha is dropped
/// and grayscale is expanded. An EXIF orientation tag is applied, so the
/// pixel grid is upright the way a viewer would show it.
pub fn decode_color(image_data: &[u8]) -> Result<RgbImage, ImagePipelineError> {
    if image_data.is_empty() {
        return Err(ImagePipelineError::InvalidImage(
            "image payload is empty".to_string(),
        ));
    }

    let invalid = |e: image::ImageError| ImagePipelineError::InvalidImage(e.to_string());

    let mut decoder = image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| ImagePipelineError::InvalidImage(e.to_string()))?
        .into_decoder()
        .map_err(invalid)?;

    let orientation = decoder.orientation().unwrap_or_else(|e| {
        tracing::debug!("Ignoring unreadable EXIF orientation: {}", e);
        Orientation::NoTransforms
    });

    let mut decoded = DynamicImage::from_decoder(decoder).map_err(invalid)?;
    decoded.apply_orientation(orientation);

    Ok(decoded.to_rgb8())
}
