//! Analyzer stages.
//!
//! Each stage is a pure function from image bytes (plus tunables) to a
//! [`Verdict`]; stages read bytes and nothing else. The pipeline invokes
//! them in a fixed cheap-rejects-first order: size, faces, blur, duplicate.

pub mod blur;
pub mod faces;
pub mod phash;
pub mod size;

mod support;

use serde_json::Value;

use crate::record::ValidationCode;

/// Outcome of a single analyzer stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept {
        diagnostics: Value,
    },
    Reject {
        code: ValidationCode,
        message: String,
        diagnostics: Value,
    },
}

impl Verdict {
    pub fn accept(diagnostics: Value) -> Self {
        Verdict::Accept { diagnostics }
    }

    pub fn reject(code: ValidationCode, message: impl Into<String>, diagnostics: Value) -> Self {
        Verdict::Reject {
            code,
            message: message.into(),
            diagnostics,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }

    pub fn diagnostics(&self) -> &Value {
        match self {
            Verdict::Accept { diagnostics } => diagnostics,
            Verdict::Reject { diagnostics, .. } => diagnostics,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Deterministic image fixtures for analyzer tests. No RNG crate: a
    //! small LCG keeps the noise reproducible across runs.

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    pub fn lcg_noise(width: u32, height: u32, seed: u64) -> DynamicImage {
        let mut state = seed | 1;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        };
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([next(), next(), next()]);
        }
        DynamicImage::ImageRgb8(img)
    }

    pub fn flat(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = Rgb(color);
        }
        DynamicImage::ImageRgb8(img)
    }

    /// Left half black, right half white. High color sigma, strong edges.
    pub fn split(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, _y, pixel) in img.enumerate_pixels_mut() {
            *pixel = if x < width / 2 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            };
        }
        DynamicImage::ImageRgb8(img)
    }

    pub fn encode_png(img: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub fn encode_jpeg(img: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }
}
