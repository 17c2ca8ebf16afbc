//! Face-count heuristic.
//!
//! Produces a conservative estimate of how many human subjects a photo
//! contains using only image statistics; estimates clamp to {0, 1, 2}. The
//! stage is fail-open end to end: an analysis error falls back to an
//! edge-density pass, and a fallback error lands on an estimate of one.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde_json::{json, Value};
use tracing::debug;

use crate::analysis::support::{channel_sigmas, convolve3x3, decode, luma_mean_sigma, mean_sigma};
use crate::analysis::Verdict;
use crate::record::ValidationCode;
use crate::settings::FaceRules;

const LAPLACIAN: [[f64; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]];

/// Strict variant: rejects whenever the estimate exceeds one subject.
pub fn analyze(bytes: &[u8], rules: &FaceRules) -> Verdict {
    let (estimate, diagnostics) = match estimate_subjects(bytes, rules) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!("face estimate failed, using edge-density fallback: {e}");
            match edge_density_estimate(bytes, rules) {
                Ok(estimate) => (
                    estimate,
                    json!({ "estimate": estimate, "fallback": "edge_density" }),
                ),
                // Fail open: a single subject is the least damaging guess.
                Err(_) => (1, json!({ "estimate": 1, "fallback": "fail_open" })),
            }
        }
    };

    if estimate > 1 {
        Verdict::reject(
            ValidationCode::MultipleFacesDetected,
            "Multiple faces detected. Please upload a photo with only one person.",
            diagnostics,
        )
    } else {
        Verdict::accept(diagnostics)
    }
}

/// Pipeline variant: re-examines a reject and tolerates solid-background
/// single-subject portraits.
pub fn analyze_guarded(bytes: &[u8], rules: &FaceRules) -> Verdict {
    match analyze(bytes, rules) {
        verdict @ Verdict::Accept { .. } => verdict,
        Verdict::Reject {
            code,
            message,
            mut diagnostics,
        } => {
            if portrait_override(bytes, rules) {
                debug!("face reject overridden by portrait heuristic");
                if let Some(map) = diagnostics.as_object_mut() {
                    map.insert("portraitOverride".into(), Value::Bool(true));
                }
                Verdict::accept(diagnostics)
            } else {
                Verdict::Reject {
                    code,
                    message,
                    diagnostics,
                }
            }
        }
    }
}

/// Accept a rejected verdict when the photo looks like a single portrait:
/// portrait orientation or small frame, or a near-monochrome background.
fn portrait_override(bytes: &[u8], rules: &FaceRules) -> bool {
    let Ok(img) = decode(bytes) else {
        return false;
    };
    let (width, height) = (img.width(), img.height());
    if height > width || (width < rules.portrait_max_dim && height < rules.portrait_max_dim) {
        return true;
    }
    let sigmas = channel_sigmas(&img);
    let mean_sigma = sigmas.iter().sum::<f64>() / sigmas.len() as f64;
    mean_sigma < rules.portrait_color_sigma
}

fn estimate_subjects(bytes: &[u8], rules: &FaceRules) -> crate::error::Result<(u32, Value)> {
    let img = decode(bytes)?;
    let (width, height) = (img.width(), img.height());
    let aspect = width as f64 / height.max(1) as f64;

    // High-resolution short-circuits: panoramas and very large landscape
    // frames are almost never single portraits.
    if (width > rules.hires_width || height > rules.hires_height) && aspect > rules.hires_aspect {
        return Ok((
            2,
            json!({ "estimate": 2, "shortCircuit": "panorama", "width": width, "height": height }),
        ));
    }
    if (width as u64 * height as u64) > rules.hires_pixels && width >= height {
        return Ok((
            2,
            json!({ "estimate": 2, "shortCircuit": "megapixels", "width": width, "height": height }),
        ));
    }

    let scaled = downscale(&img, rules.downscale_max);
    let gray = scaled.to_luma8();
    let (mean, sigma) = luma_mean_sigma(&gray);

    if sigma > rules.complex_sigma
        && width > rules.complex_min_width
        && height > rules.complex_min_height
    {
        return Ok((
            2,
            json!({ "estimate": 2, "shortCircuit": "complex_scene", "sigma": sigma }),
        ));
    }

    let features = grid_features(&gray, rules);
    let clusters = cluster(&features, rules.cluster_distance);
    let mut estimate = clusters.len() as u32;

    // Post-hoc adjustments.
    if clusters.len() == 1 && clusters[0].len() >= rules.wide_cluster_features {
        let bbox_aspect = bounding_box_aspect(&clusters[0]);
        if bbox_aspect > rules.wide_cluster_aspect {
            estimate = 2;
        }
    }
    if features.len() > rules.many_features {
        estimate = estimate.max(2);
    }
    if features.len() > rules.some_features && estimate == 0 {
        estimate = 1;
    }
    if estimate == 0 && aspect > rules.landscape_aspect && width > rules.landscape_min_width {
        estimate = 1;
    }
    let estimate = estimate.min(2);

    Ok((
        estimate,
        json!({
            "estimate": estimate,
            "mean": mean,
            "sigma": sigma,
            "features": features.len(),
            "clusters": clusters.len(),
        }),
    ))
}

fn downscale(img: &DynamicImage, max: u32) -> DynamicImage {
    if img.width() > max || img.height() > max {
        img.resize(max, max, FilterType::Triangle)
    } else {
        img.clone()
    }
}

/// A retained grid feature, positioned at its cell center in downscaled
/// pixel coordinates.
#[derive(Debug, Clone, Copy)]
struct Feature {
    x: f64,
    y: f64,
}

/// Partitions the grayscale into a cell grid and marks cells whose mean
/// intensity deviates sharply from their 4-neighborhood.
fn grid_features(gray: &GrayImage, rules: &FaceRules) -> Vec<Feature> {
    let cells = rules.grid_cells.max(1);
    let (width, height) = gray.dimensions();
    let cell_w = (width / cells).max(1);
    let cell_h = (height / cells).max(1);
    let cols = (width / cell_w).min(cells).max(1) as usize;
    let rows = (height / cell_h).min(cells).max(1) as usize;

    let mut means = vec![0.0f64; cols * rows];
    for row in 0..rows {
        for col in 0..cols {
            let x0 = col as u32 * cell_w;
            let y0 = row as u32 * cell_h;
            let (mut sum, mut count) = (0.0, 0u64);
            for y in y0..(y0 + cell_h).min(height) {
                for x in x0..(x0 + cell_w).min(width) {
                    sum += gray.get_pixel(x, y).0[0] as f64;
                    count += 1;
                }
            }
            means[row * cols + col] = if count > 0 { sum / count as f64 } else { 0.0 };
        }
    }

    let (_, sigma_prime) = mean_sigma(means.iter().copied());
    let threshold = rules.feature_delta_factor * sigma_prime;

    let mut features = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let own = means[row * cols + col];
            let mut delta_sum = 0.0;
            let mut neighbors = 0u32;
            if col > 0 {
                delta_sum += (own - means[row * cols + col - 1]).abs();
                neighbors += 1;
            }
            if col + 1 < cols {
                delta_sum += (own - means[row * cols + col + 1]).abs();
                neighbors += 1;
            }
            if row > 0 {
                delta_sum += (own - means[(row - 1) * cols + col]).abs();
                neighbors += 1;
            }
            if row + 1 < rows {
                delta_sum += (own - means[(row + 1) * cols + col]).abs();
                neighbors += 1;
            }
            if neighbors == 0 {
                continue;
            }
            let delta = delta_sum / neighbors as f64;
            if delta <= threshold || threshold <= 0.0 {
                continue;
            }
            let ratio = delta / threshold;
            let confidence = (ratio / 2.0).min(rules.feature_confidence_cap);
            if confidence > rules.feature_confidence_min {
                features.push(Feature {
                    x: (col as f64 + 0.5) * cell_w as f64,
                    y: (row as f64 + 0.5) * cell_h as f64,
                });
            }
        }
    }
    features
}

/// Greedy proximity clustering; each cluster is one face candidate.
fn cluster(features: &[Feature], max_distance: f64) -> Vec<Vec<Feature>> {
    let mut assignment = vec![usize::MAX; features.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..features.len() {
        if assignment[i] != usize::MAX {
            continue;
        }
        let id = clusters.len();
        let mut frontier = vec![i];
        assignment[i] = id;
        let mut members = Vec::new();
        while let Some(current) = frontier.pop() {
            members.push(current);
            for next in 0..features.len() {
                if assignment[next] != usize::MAX {
                    continue;
                }
                let dx = features[current].x - features[next].x;
                let dy = features[current].y - features[next].y;
                if (dx * dx + dy * dy).sqrt() <= max_distance {
                    assignment[next] = id;
                    frontier.push(next);
                }
            }
        }
        clusters.push(members);
    }

    clusters
        .into_iter()
        .map(|members| members.into_iter().map(|i| features[i]).collect())
        .collect()
}

/// Width-over-height of the cluster bounding box; a horizontally stretched
/// box suggests side-by-side subjects rather than one face.
fn bounding_box_aspect(features: &[Feature]) -> f64 {
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;
    for f in features {
        min_x = min_x.min(f.x);
        max_x = max_x.max(f.x);
        min_y = min_y.min(f.y);
        max_y = max_y.max(f.y);
    }
    let bbox_w = max_x - min_x;
    let bbox_h = max_y - min_y;
    if bbox_h <= f64::EPSILON {
        return f64::MAX;
    }
    bbox_w / bbox_h
}

/// Fallback: Laplacian edge density, scaled into the {0, 1, 2} range.
fn edge_density_estimate(bytes: &[u8], rules: &FaceRules) -> crate::error::Result<u32> {
    let img = decode(bytes)?;
    let gray = downscale(&img, rules.downscale_max).to_luma8();
    let responses = convolve3x3(&gray, LAPLACIAN);
    let strong = responses
        .iter()
        .filter(|v| v.abs() > rules.edge_strong)
        .count();
    let density = strong as f64 / responses.len().max(1) as f64;
    Ok((density * rules.edge_density_scale).min(2.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testutil::{encode_jpeg, encode_png, flat, split};
    use image::{Rgb, RgbImage};

    /// Two bright square blobs on black, at opposite corners.
    fn two_blobs(width: u32, height: u32, side: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let top_left = x < side && y < side;
            let bottom_right = x >= width - side && y >= height - side;
            *pixel = if top_left || bottom_right {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            };
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn flat_portrait_accepts_with_zero_estimate() {
        let bytes = encode_png(&flat(600, 900, [120, 120, 120]));
        let verdict = analyze(&bytes, &FaceRules::default());
        assert!(verdict.is_accept());
        assert_eq!(verdict.diagnostics()["estimate"], 0);
    }

    #[test]
    fn panorama_short_circuits_to_two() {
        let bytes = encode_png(&flat(5200, 2000, [90, 90, 90]));
        let verdict = analyze(&bytes, &FaceRules::default());
        assert!(!verdict.is_accept());
        assert_eq!(verdict.diagnostics()["shortCircuit"], "panorama");
    }

    #[test]
    fn very_large_landscape_short_circuits_to_two() {
        // 18 MP at aspect 2.0: over the megapixel bar, not a portrait.
        let bytes = encode_jpeg(&split(6000, 3000));
        let verdict = analyze(&bytes, &FaceRules::default());
        match verdict {
            Verdict::Reject { code, .. } => {
                assert_eq!(code, ValidationCode::MultipleFacesDetected)
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn guarded_variant_keeps_rejecting_colorful_large_frames() {
        // Color sigma of a half-black half-white frame is far above the
        // portrait-override tolerance, so the reject stands.
        let bytes = encode_jpeg(&split(6000, 3000));
        let verdict = analyze_guarded(&bytes, &FaceRules::default());
        assert!(!verdict.is_accept());
    }

    #[test]
    fn empty_landscape_raises_estimate_to_one_and_accepts() {
        let bytes = encode_png(&flat(1600, 800, [200, 200, 200]));
        let verdict = analyze(&bytes, &FaceRules::default());
        assert!(verdict.is_accept());
        assert_eq!(verdict.diagnostics()["estimate"], 1);
    }

    #[test]
    fn two_separated_blobs_reject_under_the_strict_variant() {
        let bytes = encode_png(&two_blobs(1000, 1000, 200));
        let verdict = analyze(&bytes, &FaceRules::default());
        match verdict {
            Verdict::Reject { code, .. } => {
                assert_eq!(code, ValidationCode::MultipleFacesDetected)
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn small_frame_reject_is_overridden_by_the_portrait_guard() {
        let bytes = encode_png(&two_blobs(1000, 1000, 200));
        let verdict = analyze_guarded(&bytes, &FaceRules::default());
        assert!(verdict.is_accept());
        assert_eq!(verdict.diagnostics()["portraitOverride"], true);
    }

    #[test]
    fn undecodable_bytes_fail_open_to_a_single_subject() {
        let verdict = analyze(b"not an image at all", &FaceRules::default());
        assert!(verdict.is_accept());
        assert_eq!(verdict.diagnostics()["fallback"], "fail_open");
    }
}
