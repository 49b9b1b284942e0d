use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::{Array4, ArrayView4, Axis};
use serde::Deserialize;
use std::path::Path;

use super::error::{CaptionError, CaptionResult};

/// Convert the host's `IMAGE` tensor (batch, height, width, channels; values
/// in [0, 1]) into an image. Only the first frame of the batch is used.
pub fn tensor_to_image(tensor: ArrayView4<'_, f32>) -> CaptionResult<DynamicImage> {
    let (batch, height, width, channels) = tensor.dim();
    if batch == 0 || height == 0 || width == 0 {
        return Err(CaptionError::InvalidImage(format!(
            "empty tensor of shape {:?}",
            tensor.shape()
        )));
    }

    let frame = tensor.index_axis(Axis(0), 0);
    let pixels: Vec<u8> = frame
        .iter()
        .map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8)
        .collect();
    let (w, h) = (width as u32, height as u32);

    let image = match channels {
        1 => GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
        n => {
            return Err(CaptionError::InvalidImage(format!(
                "unsupported channel count {}",
                n
            )))
        }
    };
    image.ok_or_else(|| CaptionError::InvalidImage("pixel buffer size mismatch".to_string()))
}

/// Build a single-frame host tensor from an image, as the host would hand it
/// to the node.
pub fn image_to_tensor(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 3));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Square(u32),
    Dims { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
}

impl SizeSpec {
    fn dims(&self) -> (u32, u32) {
        match *self {
            SizeSpec::Square(s) => (s, s),
            SizeSpec::Dims { height, width } => (width, height),
            SizeSpec::ShortestEdge { shortest_edge } => (shortest_edge, shortest_edge),
        }
    }
}

/// Subset of a HuggingFace `preprocessor_config.json`.
#[derive(Debug, Default, Deserialize)]
struct PreprocessorConfig {
    crop_size: Option<SizeSpec>,
    size: Option<SizeSpec>,
    image_mean: Option<Vec<f32>>,
    image_std: Option<Vec<f32>>,
    rescale_factor: Option<f32>,
}

/// Letterbox resize, rescale and normalise into the vision encoder's input.
#[derive(Debug, Clone, PartialEq)]
pub struct VlmImageProcessor {
    size: (u32, u32),
    image_mean: [f32; 3],
    image_std: [f32; 3],
    rescale_factor: f32,
}

impl VlmImageProcessor {
    pub fn new() -> Self {
        Self {
            size: (1024, 1024),
            image_mean: [0.0, 0.0, 0.0],
            image_std: [1.0, 1.0, 1.0],
            rescale_factor: 1.0 / 255.0,
        }
    }

    /// Read `preprocessor_config.json`; missing fields keep their defaults.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: PreprocessorConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut processor = Self::new();
        if let Some(size) = config.crop_size.as_ref().or(config.size.as_ref()) {
            processor.size = size.dims();
        }
        if let Some(mean) = config.image_mean.as_deref().and_then(rgb_triplet) {
            processor.image_mean = mean;
        }
        if let Some(std) = config.image_std.as_deref().and_then(rgb_triplet) {
            processor.image_std = std;
        }
        if let Some(factor) = config.rescale_factor {
            processor.rescale_factor = factor;
        }
        Ok(processor)
    }

    /// Output shape: [1, 3, height, width].
    pub fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let canvas = self.letterbox(&image.to_rgb8());
        let (width, height) = canvas.dimensions();

        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 * self.rescale_factor
                    - self.image_mean[c])
                    / self.image_std[c];
            }
        }
        tensor
    }

    /// Scale to fit, keeping aspect ratio, centred on a black canvas.
    fn letterbox(&self, image: &RgbImage) -> RgbImage {
        let (target_w, target_h) = self.size;
        let (orig_w, orig_h) = image.dimensions();
        let scale = (target_w as f32 / orig_w as f32).min(target_h as f32 / orig_h as f32);
        let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target_h);

        let resized =
            image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Lanczos3);
        let mut canvas = RgbImage::new(target_w, target_h);
        image::imageops::overlay(
            &mut canvas,
            &resized,
            ((target_w - new_w) / 2) as i64,
            ((target_h - new_h) / 2) as i64,
        );
        canvas
    }
}

impl Default for VlmImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn rgb_triplet(values: &[f32]) -> Option<[f32; 3]> {
    match values {
        [r, g, b] => Some([*r, *g, *b]),
        [v] => Some([*v; 3]),
        _ => None,
    }
}
