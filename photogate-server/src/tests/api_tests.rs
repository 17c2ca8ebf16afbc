use axum::http::{Method, StatusCode};
use tower::ServiceExt;

use super::test_utils::*;

#[tokio::test]
async fn health_reports_ok() {
    let (_dir, router) = setup_test_router();
    let response = router.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn upload_without_files_is_rejected() {
    let (_dir, router) = setup_test_router();
    let response = router.oneshot(upload_request(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], true);
    assert!(body["message"].as_str().unwrap().contains("no files"));
}

#[tokio::test]
async fn upload_rejects_unsupported_extensions() {
    let (_dir, router) = setup_test_router();
    let parts = [("images", "notes.txt", "text/plain", b"hello".to_vec())];
    let response = router.oneshot(upload_request(&parts)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], true);
}

#[tokio::test]
async fn upload_rejects_oversize_files() {
    let (_dir, router) = setup_test_router();
    // The per-file cap applies before any decode.
    let oversize = vec![0u8; 10 * 1024 * 1024 + 1];
    let parts = [("images", "big.jpg", "image/jpeg", oversize)];
    let response = router.oneshot(upload_request(&parts)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_rejects_batches_over_ten_files() {
    let (_dir, router) = setup_test_router();
    let png = noise_png(32, 32, 1);
    let parts: Vec<(&str, &str, &str, Vec<u8>)> = (0..11)
        .map(|_| ("images", "photo.png", "image/png", png.clone()))
        .collect();
    let response = router.oneshot(upload_request(&parts)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_processes_and_serves_the_record() {
    let (_dir, router) = setup_test_router();
    let parts = [("images", "good.png", "image/png", noise_png(900, 900, 3))];

    let response = router.clone().oneshot(upload_request(&parts)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["images"][0]["status"], "PENDING");
    assert_eq!(body["images"][0]["originalName"], "good.png");
    let id = body["images"][0]["id"].as_str().unwrap().to_string();

    let image = wait_terminal(&router, &id).await;
    assert_eq!(image["status"], "PROCESSED");
    assert!(image["originalUrl"]
        .as_str()
        .unwrap()
        .starts_with("http://localhost:3000/uploads/original/"));
    assert!(image["processedUrl"]
        .as_str()
        .unwrap()
        .starts_with("http://localhost:3000/uploads/processed/"));
    let p_hash = image["metaData"]["pHash"].as_str().unwrap();
    assert_eq!(p_hash.len(), 32);

    // Listing carries pagination and the record itself.
    let response = router
        .clone()
        .oneshot(get_request("/api/images?page=1&limit=10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["pagination"]["total"], 1);
    assert_eq!(body["pagination"]["pages"], 1);
    assert_eq!(body["images"][0]["id"], id.as_str());

    // Status filter is honored.
    let response = router
        .clone()
        .oneshot(get_request("/api/images?status=FAILED"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["pagination"]["total"], 0);
}

#[tokio::test]
async fn invalid_list_parameters_are_rejected() {
    let (_dir, router) = setup_test_router();

    let response = router
        .clone()
        .oneshot(get_request("/api/images?page=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .clone()
        .oneshot(get_request("/api/images?status=SPARKLING"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_images_read_as_404() {
    let (_dir, router) = setup_test_router();
    let missing = "00000000-0000-0000-0000-000000000000";

    for request in [
        get_request(&format!("/api/images/{missing}")),
        request(Method::DELETE, &format!("/api/images/{missing}")),
        request(Method::POST, &format!("/api/images/{missing}/process")),
    ] {
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], true);
        assert!(body["message"].is_string());
    }

    // Garbage ids read the same as unknown ids.
    let response = router
        .clone()
        .oneshot(get_request("/api/images/not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_the_record() {
    let (_dir, router) = setup_test_router();
    let parts = [("images", "gone.png", "image/png", noise_png(900, 900, 4))];
    let response = router.clone().oneshot(upload_request(&parts)).await.unwrap();
    let body = body_json(response).await;
    let id = body["images"][0]["id"].as_str().unwrap().to_string();
    wait_terminal(&router, &id).await;

    let response = router
        .clone()
        .oneshot(request(Method::DELETE, &format!("/api/images/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);

    let response = router
        .clone()
        .oneshot(get_request(&format!("/api/images/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reprocess_returns_202_for_failed_and_400_for_processed() {
    let (_dir, router) = setup_test_router();

    // A record that fails the resolution gate.
    let parts = [("images", "small.png", "image/png", noise_png(500, 500, 5))];
    let response = router.clone().oneshot(upload_request(&parts)).await.unwrap();
    let body = body_json(response).await;
    let failed_id = body["images"][0]["id"].as_str().unwrap().to_string();
    let image = wait_terminal(&router, &failed_id).await;
    assert_eq!(image["status"], "FAILED");
    assert_eq!(
        image["metaData"]["validationErrors"][0],
        "size_validation_failed"
    );

    let response = router
        .clone()
        .oneshot(request(Method::POST, &format!("/api/images/{failed_id}/process")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["imageId"], failed_id.as_str());
    let image = wait_terminal(&router, &failed_id).await;
    assert_eq!(image["status"], "FAILED");

    // A record that goes all the way through refuses re-processing.
    let parts = [("images", "done.png", "image/png", noise_png(900, 900, 6))];
    let response = router.clone().oneshot(upload_request(&parts)).await.unwrap();
    let body = body_json(response).await;
    let processed_id = body["images"][0]["id"].as_str().unwrap().to_string();
    let image = wait_terminal(&router, &processed_id).await;
    assert_eq!(image["status"], "PROCESSED");

    let response = router
        .clone()
        .oneshot(request(Method::POST, &format!("/api/images/{processed_id}/process")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
