//! Dense tensor helpers shared by the prompt encoder and the diffusers.
//!
//! All operations are pure and allocate fresh buffers; latents flow through
//! the diffusion loop by move, so nothing here aliases its inputs.

use ndarray::{concatenate, Array4, ArrayD, Axis};

use crate::error::{DiffusionError, Result};

/// Concatenates `n` copies of `tensor` along the batch axis.
pub fn repeat(tensor: &ArrayD<f32>, n: usize) -> Result<ArrayD<f32>> {
    let views: Vec<_> = (0..n.max(1)).map(|_| tensor.view()).collect();
    concatenate(Axis(0), &views)
        .map_err(|e| DiffusionError::shape(format!("{n} copies of {:?}", tensor.shape()), e.to_string()))
}

/// Concatenates two tensors along the batch axis.
pub fn concat_batch(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    concatenate(Axis(0), &[a.view(), b.view()])
        .map_err(|_| DiffusionError::shape(format!("{:?}", a.shape()), format!("{:?}", b.shape())))
}

/// Splits a guidance batch of two along the batch axis into (negative, positive).
pub fn chunk2(tensor: &ArrayD<f32>) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    if tensor.shape()[0] != 2 {
        return Err(DiffusionError::shape("batch of 2", format!("{:?}", tensor.shape())));
    }
    let neg = tensor.index_axis(Axis(0), 0).insert_axis(Axis(0)).to_owned();
    let pos = tensor.index_axis(Axis(0), 1).insert_axis(Axis(0)).to_owned();
    Ok((neg, pos))
}

pub fn multiply_by_scalar(tensor: &ArrayD<f32>, value: f32) -> ArrayD<f32> {
    tensor.mapv(|v| v * value)
}

pub fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a.shape() != b.shape() {
        return Err(DiffusionError::shape(format!("{:?}", a.shape()), format!("{:?}", b.shape())));
    }
    Ok(a + b)
}

/// Classifier-free guidance: `neg + w * (pos - neg)`.
pub fn guidance_combine(neg: &ArrayD<f32>, pos: &ArrayD<f32>, scale: f32) -> Result<ArrayD<f32>> {
    if neg.shape() != pos.shape() {
        return Err(DiffusionError::shape(format!("{:?}", neg.shape()), format!("{:?}", pos.shape())));
    }
    Ok(neg + (pos - neg).mapv(|v| v * scale))
}

/// Maps model output in [-1, 1] to [0, 1], clamped.
pub fn normalize_minus_one_to_one(tensor: &ArrayD<f32>) -> ArrayD<f32> {
    tensor.mapv(|v| ((v + 1.0) / 2.0).clamp(0.0, 1.0))
}

/// Maps one model-output value in [-1, 1] to a byte pixel.
pub fn to_byte_pixel(value: f32) -> u8 {
    ((value / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Converts a decoded `[1, 3, H, W]` pixel tensor in [0, 1] to packed RGB bytes.
pub fn to_rgb_bytes(pixels: &Array4<f32>) -> Vec<u8> {
    let (_, channels, height, width) = pixels.dim();
    debug_assert_eq!(channels, 3);
    let mut bytes = Vec::with_capacity(height * width * 3);
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                bytes.push((pixels[[0, c, y, x]].clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn sample() -> ArrayD<f32> {
        Array::from_shape_vec(vec![1, 2, 2], vec![0.0, 1.0, -1.0, 0.5]).unwrap()
    }

    #[test]
    fn repeat_grows_batch_axis() {
        let t = sample();
        let r = repeat(&t, 2).unwrap();
        assert_eq!(r.shape(), &[2, 2, 2]);
        assert_eq!(r[[0, 0, 1]], r[[1, 0, 1]]);
    }

    #[test]
    fn repeat_zero_yields_one_copy() {
        let t = sample();
        assert_eq!(repeat(&t, 0).unwrap().shape(), &[1, 2, 2]);
    }

    #[test]
    fn chunk2_inverts_repeat() {
        let t = sample();
        let doubled = repeat(&t, 2).unwrap();
        let (neg, pos) = chunk2(&doubled).unwrap();
        assert_eq!(neg, t);
        assert_eq!(pos, t);
    }

    #[test]
    fn chunk2_rejects_singleton_batch() {
        assert!(chunk2(&sample()).is_err());
    }

    #[test]
    fn guidance_combine_is_linear_extrapolation() {
        let neg = Array::from_shape_vec(vec![1, 2], vec![1.0, 1.0]).unwrap();
        let pos = Array::from_shape_vec(vec![1, 2], vec![3.0, 5.0]).unwrap();
        let out = guidance_combine(&neg, &pos, 7.5).unwrap();
        assert_eq!(out[[0, 0]], 1.0 + 7.5 * 2.0);
        assert_eq!(out[[0, 1]], 1.0 + 7.5 * 4.0);
    }

    #[test]
    fn add_rejects_shape_mismatch() {
        let a = Array::zeros(vec![1, 2]);
        let b = Array::zeros(vec![2, 2]);
        assert!(add(&a, &b).is_err());
    }

    #[test]
    fn normalize_clamps_out_of_range() {
        let t = Array::from_shape_vec(vec![3], vec![-2.0, 0.0, 2.0]).unwrap();
        let n = normalize_minus_one_to_one(&t);
        assert_eq!(n[[0]], 0.0);
        assert_eq!(n[[1]], 0.5);
        assert_eq!(n[[2]], 1.0);
    }

    #[test]
    fn byte_pixel_rounds() {
        assert_eq!(to_byte_pixel(-1.0), 0);
        assert_eq!(to_byte_pixel(0.0), 128);
        assert_eq!(to_byte_pixel(1.0), 255);
    }
}
