//! Size stage: minimum resolution and minimum byte-length gates.
//!
//! Cheapest stage, runs first. Only image metadata is decoded here.

use image::ImageReader;
use serde_json::json;
use std::io::Cursor;

use crate::analysis::Verdict;
use crate::error::Result;
use crate::record::ValidationCode;
use crate::settings::SizeRules;

pub fn analyze(bytes: &[u8], rules: &SizeRules) -> Result<Verdict> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;

    if width < rules.min_width || height < rules.min_height {
        return Ok(Verdict::reject(
            ValidationCode::SizeValidationFailed,
            format!(
                "Image resolution is too low. Minimum required is {}x{}, but received {}x{}.",
                rules.min_width, rules.min_height, width, height
            ),
            json!({ "width": width, "height": height }),
        ));
    }

    let byte_length = bytes.len() as u64;
    if byte_length < rules.min_bytes {
        return Ok(Verdict::reject(
            ValidationCode::SizeValidationFailed,
            format!(
                "Image file size is too small. Minimum required is {}KB, but received {}.",
                rules.min_bytes / 1024,
                format_kb(byte_length),
            ),
            json!({ "width": width, "height": height, "byteLength": byte_length }),
        ));
    }

    Ok(Verdict::accept(json!({
        "width": width,
        "height": height,
        "byteLength": byte_length,
    })))
}

/// Observed size in KB with one decimal, e.g. "40.0KB".
fn format_kb(bytes: u64) -> String {
    format!("{:.1}KB", bytes as f64 / 1024.0)
}
