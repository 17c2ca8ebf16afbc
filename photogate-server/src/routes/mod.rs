use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::warn;

use crate::config::StorageType;
use crate::handlers::{health, images};
use crate::AppState;

/// Whole-request ceiling: a full batch of maximum-size files plus
/// multipart framing.
const BODY_LIMIT: usize = images::MAX_FILES_PER_BATCH * images::MAX_FILE_BYTES + 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(
            "/api/images",
            post(images::upload_images).get(images::list_images),
        )
        .route(
            "/api/images/{id}",
            get(images::get_image).delete(images::delete_image),
        )
        .route("/api/images/{id}/process", post(images::process_image))
        .route("/health", get(health));

    // The local blob backend needs a static collaborator to serve its
    // plain read URLs; remote backends presign instead.
    if state.config.storage_type == StorageType::Local {
        router = router.nest_service("/uploads", ServeDir::new(&state.config.upload_dir));
    }

    router
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring unparseable CORS origin: {origin}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
