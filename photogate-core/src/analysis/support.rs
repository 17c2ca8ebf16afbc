//! Shared pixel plumbing for the analyzer stages: decoding, grayscale
//! statistics, and 3x3 convolution over raw luma buffers.

use image::{DynamicImage, GrayImage};

use crate::error::Result;

pub(crate) fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

/// Mean and standard deviation of a set of samples.
pub(crate) fn mean_sigma(samples: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (mut count, mut sum) = (0u64, 0.0f64);
    for v in samples.clone() {
        count += 1;
        sum += v;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;
    let var = samples.map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    (mean, var.sqrt())
}

pub(crate) fn luma_mean_sigma(gray: &GrayImage) -> (f64, f64) {
    mean_sigma(gray.pixels().map(|p| p.0[0] as f64))
}

/// Per-channel standard deviations over an RGB view of the image.
pub(crate) fn channel_sigmas(img: &DynamicImage) -> [f64; 3] {
    let rgb = img.to_rgb8();
    let mut out = [0.0; 3];
    for (channel, slot) in out.iter_mut().enumerate() {
        let (_, sigma) = mean_sigma(rgb.pixels().map(|p| p.0[channel] as f64));
        *slot = sigma;
    }
    out
}

/// 3x3 convolution over the luma plane with replicated borders. Returns raw
/// (unclamped) responses, row-major.
pub(crate) fn convolve3x3(gray: &GrayImage, kernel: [[f64; 3]; 3]) -> Vec<f64> {
    let (width, height) = gray.dimensions();
    let mut out = vec![0.0; (width * height) as usize];
    if width == 0 || height == 0 {
        return out;
    }

    let sample = |x: i64, y: i64| -> f64 {
        let x = x.clamp(0, width as i64 - 1) as u32;
        let y = y.clamp(0, height as i64 - 1) as u32;
        gray.get_pixel(x, y).0[0] as f64
    };

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut acc = 0.0;
            for (ky, row) in kernel.iter().enumerate() {
                for (kx, weight) in row.iter().enumerate() {
                    acc += weight * sample(x + kx as i64 - 1, y + ky as i64 - 1);
                }
            }
            out[(y as u32 * width + x as u32) as usize] = acc;
        }
    }
    out
}

/// Sigma of a convolution output as if it were rendered back into an 8-bit
/// image (responses clamped to 0..=255).
pub(crate) fn clamped_sigma(responses: &[f64]) -> f64 {
    let (_, sigma) = mean_sigma(responses.iter().map(|v| v.clamp(0.0, 255.0)));
    sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn mean_sigma_of_constant_samples_is_zero_sigma() {
        let samples = [5.0f64; 16];
        let (mean, sigma) = mean_sigma(samples.iter().copied());
        assert!((mean - 5.0).abs() < 1e-9);
        assert!(sigma.abs() < 1e-9);
    }

    #[test]
    fn identity_kernel_reproduces_the_image() {
        let mut gray = GrayImage::new(4, 4);
        for (i, pixel) in gray.pixels_mut().enumerate() {
            *pixel = Luma([(i * 13 % 251) as u8]);
        }
        let kernel = [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let out = convolve3x3(&gray, kernel);
        for (response, pixel) in out.iter().zip(gray.pixels()) {
            assert!((response - pixel.0[0] as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn laplacian_of_flat_image_is_zero() {
        let gray = GrayImage::from_pixel(8, 8, Luma([77]));
        let kernel = [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]];
        let out = convolve3x3(&gray, kernel);
        assert!(out.iter().all(|v| v.abs() < 1e-9));
    }
}
