//! Perceptual fingerprinting and duplicate detection.
//!
//! The fingerprint is a 1024-bit brightness map of a 32x32 downscale,
//! summarized as an MD5 digest (32 lowercase hex characters). Identical
//! bytes always hash identically; visually identical re-encodes usually do.

use image::imageops::FilterType;
use serde_json::json;
use uuid::Uuid;

use crate::analysis::support::decode;
use crate::analysis::Verdict;
use crate::error::Result;
use crate::record::{HashCandidate, ValidationCode};
use crate::settings::DuplicateRules;

const HASH_SIDE: u32 = 32;

/// Computes the persisted perceptual hash for an image.
pub fn compute(bytes: &[u8]) -> Result<String> {
    let img = decode(bytes)?;
    // fill: ignore aspect, always exactly 32x32.
    let gray = img
        .resize_exact(HASH_SIDE, HASH_SIDE, FilterType::Triangle)
        .to_luma8();

    let pixels: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
    let average = pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64;

    // One bit per pixel, packed LSB-first.
    let mut packed = vec![0u8; pixels.len().div_ceil(8)];
    for (i, &pixel) in pixels.iter().enumerate() {
        if pixel as f64 >= average {
            packed[i / 8] |= 1 << (i % 8);
        }
    }

    Ok(format!("{:x}", md5::compute(&packed)))
}

/// An existing record the incoming image collides with.
#[derive(Debug, Clone)]
pub struct DuplicateHit {
    pub id: Uuid,
    pub original_name: String,
}

/// Checks the incoming hash and filename against the accepted corpus.
/// Exact-name matches short-circuit; otherwise the first candidate within
/// the Hamming tolerance wins.
pub fn find_duplicate(
    hash: &str,
    original_name: &str,
    candidates: &[HashCandidate],
    rules: &DuplicateRules,
) -> Option<DuplicateHit> {
    if let Some(hit) = candidates
        .iter()
        .find(|c| c.original_name.eq_ignore_ascii_case(original_name))
    {
        return Some(DuplicateHit {
            id: hit.id,
            original_name: hit.original_name.clone(),
        });
    }

    for candidate in candidates {
        let Some(candidate_hash) = candidate.meta_data.p_hash.as_deref() else {
            continue;
        };
        let Some(distance) = hamming_distance(hash, candidate_hash) else {
            continue;
        };
        if distance <= rules.max_hamming_distance {
            return Some(DuplicateHit {
                id: candidate.id,
                original_name: candidate.original_name.clone(),
            });
        }
    }
    None
}

/// Builds the verdict the pipeline records for a duplicate hit.
pub fn duplicate_verdict(hit: &DuplicateHit) -> Verdict {
    Verdict::reject(
        ValidationCode::DuplicateImageDetected,
        format!(
            "This image appears to be a duplicate of \"{}\" ({}).",
            hit.original_name, hit.id
        ),
        json!({ "similarTo": hit.id, "similarName": hit.original_name }),
    )
}

/// Hamming distance over the 4-bit expansions of two hex digests. `None`
/// when the inputs are not comparable (length mismatch or non-hex).
fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    if a.len() != b.len() {
        return None;
    }
    let mut distance = 0;
    for (da, db) in a.chars().zip(b.chars()) {
        let na = da.to_digit(16)?;
        let nb = db.to_digit(16)?;
        distance += (na ^ nb).count_ones();
    }
    Some(distance)
}
