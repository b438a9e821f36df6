//! Input-image adapter.
//!
//! Conditioning images can arrive as a file path, an encoded byte buffer, an
//! already-decoded RGBA bitmap, or a raw pixel tensor. The diffusers only ever
//! call [`InputImage::get_image_tensor`], which produces a `[1, 3, H, W]`
//! float tensor at the requested resolution.

use std::path::PathBuf;

use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// Pixel value range the consumer expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageNormalizeMode {
    ZeroToOne,
    MinusOneToOne,
}

/// One conditioning image in whichever form the caller has at hand.
#[derive(Debug, Clone)]
pub enum InputImage {
    File(PathBuf),
    Bytes(Vec<u8>),
    Bitmap(RgbaImage),
    Tensor(Array4<f32>),
}

impl InputImage {
    /// Decodes, resizes and normalizes into a `[1, 3, height, width]` tensor.
    ///
    /// Tensor-backed inputs must already match the requested resolution; all
    /// other forms are resized with triangle filtering.
    pub fn get_image_tensor(
        &self,
        height: usize,
        width: usize,
        mode: ImageNormalizeMode,
    ) -> Result<Array4<f32>> {
        let decoded = match self {
            InputImage::Tensor(tensor) => {
                let dim = tensor.dim();
                if dim.0 != 1 || dim.1 != 3 || dim.2 != height || dim.3 != width {
                    return Err(DiffusionError::shape(
                        format!("[1, 3, {height}, {width}]"),
                        format!("{:?}", tensor.shape()),
                    ));
                }
                return Ok(tensor.clone());
            }
            InputImage::File(path) => image::open(path)
                .map_err(|e| DiffusionError::InvalidOptions(format!("cannot open input image {path:?}: {e}")))?,
            InputImage::Bytes(bytes) => image::load_from_memory(bytes)
                .map_err(|e| DiffusionError::InvalidOptions(format!("cannot decode input image: {e}")))?,
            InputImage::Bitmap(bitmap) => DynamicImage::ImageRgba8(bitmap.clone()),
        };

        let rgb = decoded
            .resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = match mode {
                    ImageNormalizeMode::ZeroToOne => value,
                    ImageNormalizeMode::MinusOneToOne => value * 2.0 - 1.0,
                };
            }
        }
        Ok(tensor)
    }
}

/// An ordered, already-decoded frame sequence. Frame extraction from container
/// formats happens outside the core.
#[derive(Debug, Clone, Default)]
pub struct VideoFrames {
    pub frames: Vec<InputImage>,
    /// Reuse the run seed for every frame instead of jittering it per frame.
    pub fixed_seed: bool,
}

impl VideoFrames {
    pub fn new(frames: Vec<InputImage>) -> Self {
        Self { frames, fixed_seed: false }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_input_passes_through() {
        let t = Array4::from_elem((1, 3, 8, 8), 0.25);
        let input = InputImage::Tensor(t.clone());
        let out = input.get_image_tensor(8, 8, ImageNormalizeMode::ZeroToOne).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn tensor_input_rejects_wrong_resolution() {
        let input = InputImage::Tensor(Array4::zeros((1, 3, 8, 8)));
        assert!(input.get_image_tensor(16, 16, ImageNormalizeMode::ZeroToOne).is_err());
    }

    #[test]
    fn bitmap_normalizes_to_minus_one_to_one() {
        let mut bitmap = RgbaImage::new(4, 4);
        for pixel in bitmap.pixels_mut() {
            *pixel = image::Rgba([255, 0, 127, 255]);
        }
        let input = InputImage::Bitmap(bitmap);
        let out = input.get_image_tensor(4, 4, ImageNormalizeMode::MinusOneToOne).unwrap();
        assert!((out[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((out[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!(out[[0, 2, 0, 0]].abs() < 0.01);
    }

    #[test]
    fn video_frames_default_jitters_seed() {
        let frames = VideoFrames::new(vec![]);
        assert!(!frames.fixed_seed);
        assert!(frames.is_empty());
    }
}
