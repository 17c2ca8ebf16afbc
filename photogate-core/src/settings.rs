//! Analyzer tunables.
//!
//! Every numeric threshold the stages consult lives here so operators can
//! adjust sensitivity without a rebuild. Values deserialize from an optional
//! TOML file; anything absent falls back to the defaults below.

use serde::Deserialize;
use std::path::Path;

use crate::error::{AdmissionError, Result};

/// Minimums enforced by the size stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizeRules {
    pub min_width: u32,
    pub min_height: u32,
    pub min_bytes: u64,
}

impl Default for SizeRules {
    fn default() -> Self {
        Self {
            min_width: 800,
            min_height: 800,
            min_bytes: 100 * 1024,
        }
    }
}

/// Thresholds for the statistical face-count heuristic.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceRules {
    /// Width beyond which the high-resolution short-circuit may fire.
    pub hires_width: u32,
    /// Height beyond which the high-resolution short-circuit may fire.
    pub hires_height: u32,
    /// Aspect ratio that, combined with the above, marks a panorama.
    pub hires_aspect: f64,
    /// Pixel count treated as "very large" for the non-portrait short-circuit.
    pub hires_pixels: u64,

    /// Largest edge of the analysis downscale.
    pub downscale_max: u32,
    /// Global grayscale sigma above which a large image counts as a complex scene.
    pub complex_sigma: f64,
    pub complex_min_width: u32,
    pub complex_min_height: u32,

    /// Cells per axis of the analysis grid.
    pub grid_cells: u32,
    /// Multiplier on the cross-cell sigma for the neighbor-delta feature test.
    pub feature_delta_factor: f64,
    pub feature_confidence_cap: f64,
    pub feature_confidence_min: f64,
    /// Maximum cell-coordinate distance for two features to share a cluster.
    pub cluster_distance: f64,

    /// Post-hoc: single wide cluster of at least this many features counts as two faces.
    pub wide_cluster_features: usize,
    pub wide_cluster_aspect: f64,
    /// Post-hoc: more retained features than this floors the estimate at two.
    pub many_features: usize,
    /// Post-hoc: more than this with a zero estimate raises it to one.
    pub some_features: usize,
    pub landscape_aspect: f64,
    pub landscape_min_width: u32,

    /// Fallback edge pass: normalized response above this is a strong pixel.
    pub edge_strong: f64,
    pub edge_density_scale: f64,

    /// Portrait override: both dimensions under this tolerate a reject.
    pub portrait_max_dim: u32,
    /// Portrait override: mean per-channel color sigma under this tolerates a reject.
    pub portrait_color_sigma: f64,
}

impl Default for FaceRules {
    fn default() -> Self {
        Self {
            hires_width: 5000,
            hires_height: 4000,
            hires_aspect: 2.0,
            hires_pixels: 12_000_000,
            downscale_max: 800,
            complex_sigma: 90.0,
            complex_min_width: 800,
            complex_min_height: 700,
            grid_cells: 20,
            feature_delta_factor: 0.45,
            feature_confidence_cap: 0.95,
            feature_confidence_min: 0.65,
            cluster_distance: 60.0,
            wide_cluster_features: 10,
            wide_cluster_aspect: 2.5,
            many_features: 20,
            some_features: 12,
            landscape_aspect: 1.8,
            landscape_min_width: 1500,
            edge_strong: 200.0,
            edge_density_scale: 40.0,
            portrait_max_dim: 1200,
            portrait_color_sigma: 60.0,
        }
    }
}

/// Thresholds for the four-way blur vote.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlurRules {
    /// Sharpening-response ratio above which the first method votes blurry.
    pub sharpen_ratio: f64,
    /// Per-block Laplacian variance that counts a block as sharp.
    pub block_variance: f64,
    /// Minimum fraction of sharp blocks to pass the local-variance vote.
    pub sharp_block_fraction: f64,
    pub block_divisor: u32,
    pub block_min_side: u32,
    /// Laplacian response that counts a pixel as an edge.
    pub edge_threshold: f64,
    /// Minimum fraction of edge pixels to pass the histogram vote.
    pub edge_fraction: f64,
    /// Gradient-sum threshold factor: T = factor * w * h.
    pub gradient_factor: f64,
    /// H/V imbalance ratio that flags motion blur.
    pub motion_ratio: f64,
    /// Fallback: grayscale sigma below this rejects when the ensemble errors.
    pub fallback_sigma: f64,
}

impl Default for BlurRules {
    fn default() -> Self {
        Self {
            sharpen_ratio: 0.2,
            block_variance: 100.0,
            sharp_block_fraction: 0.15,
            block_divisor: 20,
            block_min_side: 10,
            edge_threshold: 50.0,
            edge_fraction: 0.03,
            gradient_factor: 5.0,
            motion_ratio: 3.0,
            fallback_sigma: 25.0,
        }
    }
}

/// Duplicate-detection tolerances.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DuplicateRules {
    /// Maximum Hamming distance between hash bit-expansions to call a match.
    pub max_hamming_distance: u32,
}

impl Default for DuplicateRules {
    fn default() -> Self {
        Self {
            max_hamming_distance: 3,
        }
    }
}

/// Canonical-derivative parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DerivativeRules {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for DerivativeRules {
    fn default() -> Self {
        Self {
            max_width: 800,
            max_height: 800,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub size: SizeRules,
    pub faces: FaceRules,
    pub blur: BlurRules,
    pub duplicate: DuplicateRules,
    pub derivative: DerivativeRules,
}

impl AnalyzerSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| AdmissionError::InvalidRequest(format!("bad analyzer config: {e}")))
    }

    /// Loads tunables from `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::default()),
        }
    }
}
