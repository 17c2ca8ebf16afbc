//! `/api/images` handlers: multipart upload, listing, lookup, delete, and
//! manual re-processing.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use photogate_core::{ImageStatus, UploadFile};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::AppState;

/// Fixed upload interface: 1-10 files per request, 10 MiB per file.
pub const MAX_FILES_PER_BATCH: usize = 10;
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "heic", "heif"];

/// POST /api/images
pub async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("images") | Some("images[]") => {}
            _ => continue,
        }

        let original_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request("each file part needs a filename"))?;

        let extension = std::path::Path::new(&original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(AppError::bad_request(format!(
                "unsupported file type '{original_name}'; allowed extensions: {}",
                ALLOWED_EXTENSIONS.join(", ")
            )));
        }

        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| format!("image/{extension}"));

        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::bad_request(format!("failed to read '{original_name}': {e}")))?;
        if bytes.len() > MAX_FILE_BYTES {
            return Err(AppError::bad_request(format!(
                "'{original_name}' exceeds the {} MiB per-file limit",
                MAX_FILE_BYTES / 1024 / 1024
            )));
        }

        files.push(UploadFile {
            original_name,
            content_type,
            bytes,
        });
    }

    if files.is_empty() {
        return Err(AppError::bad_request("no files uploaded"));
    }
    if files.len() > MAX_FILES_PER_BATCH {
        return Err(AppError::bad_request(format!(
            "too many files: {} uploaded, maximum is {MAX_FILES_PER_BATCH}",
            files.len()
        )));
    }

    let count = files.len();
    let summaries = state
        .admission
        .upload_batch(files)
        .await
        .map_err(|e| AppError::from_admission(e, state.config.dev_mode))?;
    info!(count, "upload batch accepted");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("{count} image(s) uploaded; processing started"),
            "images": summaries,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<u64>,
    limit: Option<u64>,
    status: Option<String>,
}

/// GET /api/images
pub async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.to_ascii_uppercase()
                .parse::<ImageStatus>()
                .map_err(AppError::bad_request)
        })
        .transpose()?;

    let (images, total) = state
        .admission
        .list(status, page, limit)
        .await
        .map_err(|e| AppError::from_admission(e, state.config.dev_mode))?;

    Ok(Json(json!({
        "success": true,
        "images": images,
        "pagination": {
            "total": total,
            "page": page,
            "limit": limit,
            "pages": total.div_ceil(limit),
        },
    })))
}

/// GET /api/images/{id}
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    let image = state
        .admission
        .get(id)
        .await
        .map_err(|e| AppError::from_admission(e, state.config.dev_mode))?;
    Ok(Json(json!({ "success": true, "image": image })))
}

/// DELETE /api/images/{id}
pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&id)?;
    state
        .admission
        .delete(id)
        .await
        .map_err(|e| AppError::from_admission(e, state.config.dev_mode))?;
    Ok(Json(json!({
        "success": true,
        "message": "Image deleted",
    })))
}

/// POST /api/images/{id}/process
pub async fn process_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let id = parse_id(&id)?;
    state
        .admission
        .reprocess(id)
        .await
        .map_err(|e| AppError::from_admission(e, state.config.dev_mode))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Image queued for processing",
            "imageId": id,
        })),
    ))
}

/// Unknown and unparseable ids both read as "no such image".
fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::not_found(format!("image {raw}")))
}
