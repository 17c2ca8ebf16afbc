//! Blur heuristic: a voting ensemble of four independent sharpness tests
//! over the grayscale image, plus a directional motion-blur check. Two
//! votes reject; a motion-blur flag rejects alone.

use image::GrayImage;
use serde_json::json;
use tracing::debug;

use crate::analysis::support::{clamped_sigma, convolve3x3, decode, luma_mean_sigma};
use crate::analysis::Verdict;
use crate::error::Result;
use crate::record::ValidationCode;
use crate::settings::BlurRules;

const REJECT_MESSAGE: &str = "Image is too blurry. Please upload a clearer photo.";

const HIGH_PASS: [[f64; 3]; 3] = [[0.0, -1.0, 0.0], [-1.0, 5.0, -1.0], [0.0, -1.0, 0.0]];
const LAPLACIAN: [[f64; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]];
const SOBEL_X: [[f64; 3]; 3] = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_Y: [[f64; 3]; 3] = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

pub fn analyze(bytes: &[u8], rules: &BlurRules) -> Result<Verdict> {
    let img = decode(bytes)?;
    let gray = img.to_luma8();

    match ensemble(&gray, rules) {
        Ok(verdict) => Ok(verdict),
        Err(e) => {
            debug!("blur ensemble failed, using sigma fallback: {e}");
            Ok(sigma_fallback(&gray, rules))
        }
    }
}

fn ensemble(gray: &GrayImage, rules: &BlurRules) -> Result<Verdict> {
    let (width, height) = gray.dimensions();
    let pixels = (width as u64 * height as u64).max(1);

    // 1. Sharpening response: how much a high-pass kernel changes the
    // spread of the image.
    let (_, sigma0) = luma_mean_sigma(gray);
    let sharpened = convolve3x3(gray, HIGH_PASS);
    let sigma1 = clamped_sigma(&sharpened);
    let sharpen_ratio = (sigma1 - sigma0) / sigma0.max(f64::EPSILON);
    let sharpen_vote = sharpen_ratio > rules.sharpen_ratio;

    // 2. Local variance over Laplacian blocks.
    let laplacian = convolve3x3(gray, LAPLACIAN);
    let block_side = (width.min(height) / rules.block_divisor).max(rules.block_min_side);
    let sharp_fraction = sharp_block_fraction(&laplacian, width, height, block_side, rules);
    let block_vote = sharp_fraction < rules.sharp_block_fraction;

    // 3. Edge histogram on the same Laplacian output.
    let edge_pixels = laplacian
        .iter()
        .filter(|v| v.abs() > rules.edge_threshold)
        .count() as u64;
    let edge_fraction = edge_pixels as f64 / pixels as f64;
    let edge_vote = edge_fraction < rules.edge_fraction;

    // 4. Gradient sums.
    let horizontal: f64 = convolve3x3(gray, SOBEL_X).iter().map(|v| v.abs()).sum();
    let vertical: f64 = convolve3x3(gray, SOBEL_Y).iter().map(|v| v.abs()).sum();
    let gradient_threshold = rules.gradient_factor * pixels as f64;
    let gradient_vote = horizontal < gradient_threshold && vertical < gradient_threshold;

    let strongest = horizontal.max(vertical);
    let weakest = horizontal.min(vertical);
    let motion_blur = strongest / weakest.max(f64::EPSILON) > rules.motion_ratio
        && (horizontal < gradient_threshold || vertical < gradient_threshold);

    let votes =
        [sharpen_vote, block_vote, edge_vote, gradient_vote].iter().filter(|v| **v).count();

    let diagnostics = json!({
        "sharpenRatio": sharpen_ratio,
        "sharpenVote": sharpen_vote,
        "sharpBlockFraction": sharp_fraction,
        "blockVote": block_vote,
        "edgeFraction": edge_fraction,
        "edgeVote": edge_vote,
        "gradientHorizontal": horizontal,
        "gradientVertical": vertical,
        "gradientVote": gradient_vote,
        "motionBlur": motion_blur,
        "votes": votes,
    });

    if votes >= 2 || motion_blur {
        Ok(Verdict::reject(
            ValidationCode::BlurryImageDetected,
            REJECT_MESSAGE,
            diagnostics,
        ))
    } else {
        Ok(Verdict::accept(diagnostics))
    }
}

fn sharp_block_fraction(
    laplacian: &[f64],
    width: u32,
    height: u32,
    block_side: u32,
    rules: &BlurRules,
) -> f64 {
    let mut blocks = 0u64;
    let mut sharp_blocks = 0u64;

    let mut y0 = 0;
    while y0 < height {
        let mut x0 = 0;
        while x0 < width {
            let mut samples = Vec::new();
            for y in y0..(y0 + block_side).min(height) {
                for x in x0..(x0 + block_side).min(width) {
                    samples.push(laplacian[(y * width + x) as usize]);
                }
            }
            let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
            let variance =
                samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len().max(1) as f64;
            blocks += 1;
            if variance > rules.block_variance {
                sharp_blocks += 1;
            }
            x0 += block_side;
        }
        y0 += block_side;
    }

    sharp_blocks as f64 / blocks.max(1) as f64
}

/// Degenerate-input fallback: a near-zero grayscale spread reads as blurry.
fn sigma_fallback(gray: &GrayImage, rules: &BlurRules) -> Verdict {
    let (_, sigma) = luma_mean_sigma(gray);
    let diagnostics = json!({ "fallback": "sigma", "sigma": sigma });
    if sigma < rules.fallback_sigma {
        Verdict::reject(ValidationCode::BlurryImageDetected, REJECT_MESSAGE, diagnostics)
    } else {
        Verdict::accept(diagnostics)
    }
}
