use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use sitelens_contracts::scenarios::{DEFAULT_BATCH_SCENARIO, DEFAULT_SINGLE_SCENARIO};
use sitelens_contracts::{AnalysisError, ImageUpload};
use sitelens_engine::Analyzer;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    analyzer: Analyzer,
}

/// Request-level failure mapped to `{"error": ...}` with an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Multipart(MultipartError),
    Analysis(AnalysisError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Multipart(err) => err.status(),
            Self::Analysis(err) if err.is_validation() => StatusCode::BAD_REQUEST,
            Self::Analysis(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            Self::Multipart(err) => err.body_text(),
            Self::Analysis(err) => err.to_string(),
        }
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        Self::Analysis(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Multipart(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.message();
        if status.is_server_error() {
            warn!(status = status.as_u16(), "request failed: {message}");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(analyzer: Analyzer, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/batch-analyze", post(batch_analyze))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState { analyzer })
}

/// Serves until Ctrl-C, then drains in-flight requests.
pub async fn serve(analyzer: Analyzer, bind: &str, max_upload_bytes: usize) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let addr: SocketAddr = listener.local_addr()?;
    if let Some(events) = analyzer.events() {
        let mut payload = Map::new();
        payload.insert("bind".to_string(), Value::String(addr.to_string()));
        events.record("service_started", payload);
    }
    info!(%addr, max_upload_bytes, "sitelens listening");

    axum::serve(listener, router(analyzer, max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;
    info!("sitelens stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut image: Option<ImageUpload> = None;
    let mut scenario: Option<String> = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" if image.is_none() => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                image = Some(ImageUpload::new(filename, bytes.to_vec()));
            }
            "scenario" => scenario = Some(field.text().await?),
            _ => {}
        }
    }

    let Some(image) = image else {
        return Err(ApiError::BadRequest("No image provided".to_string()));
    };
    let scenario = scenario_or(scenario, DEFAULT_SINGLE_SCENARIO);
    let outcome = state.analyzer.analyze_one(image, &scenario).await?;
    Ok(Json(outcome.to_response_json()))
}

async fn batch_analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut images = Vec::new();
    let mut scenario: Option<String> = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "images" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                // Browsers submit one nameless empty part for an empty file input.
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                images.push(ImageUpload::new(filename, bytes.to_vec()));
            }
            "scenario" => scenario = Some(field.text().await?),
            _ => {}
        }
    }

    let scenario = scenario_or(scenario, DEFAULT_BATCH_SCENARIO);
    let batch = state.analyzer.analyze_batch(images, &scenario).await?;
    Ok(Json(batch.to_response_json()))
}

fn scenario_or(requested: Option<String>, default: &str) -> String {
    requested
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::bail;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use sitelens_contracts::ScenarioRegistry;
    use sitelens_engine::{DryrunVision, InMemoryBlobStore, TextGenerator};
    use tower::ServiceExt;

    use super::*;

    const BOUNDARY: &str = "sitelens-test-boundary";

    enum Part<'a> {
        File(&'a str, &'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(name, filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: image/png\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn dryrun_app() -> Router {
        let analyzer = Analyzer::dryrun(Arc::new(ScenarioRegistry::default()));
        router(analyzer, 1024 * 1024)
    }

    struct RefusingGenerator;

    #[async_trait]
    impl TextGenerator for RefusingGenerator {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            bail!("quota exhausted")
        }
    }

    fn failing_app() -> Router {
        let analyzer = Analyzer::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(DryrunVision),
            Arc::new(RefusingGenerator),
            Arc::new(ScenarioRegistry::default()),
        );
        router(analyzer, 1024 * 1024)
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn analyze_returns_full_envelope() {
        let request = multipart_request(
            "/analyze",
            &[
                Part::File("image", "pier.png", b"\x89PNG"),
                Part::Text("scenario", "Structural Analysis"),
            ],
        );
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["scenario"], json!("Structural Analysis"));
        assert_eq!(body["detected_labels"], json!([]));
        assert_eq!(body["detected_objects"], json!([]));
        assert_eq!(body["detected_text"], json!([]));
        let image_uri = body["image_uri"].as_str().unwrap_or_default();
        assert!(image_uri.starts_with("memory://civil-eng/Structural_Analysis/"));
        assert!(image_uri.ends_with("-pier.png"));
        assert!(body["ai_analysis"]
            .as_str()
            .map(|text| text.starts_with("[dryrun]"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn analyze_defaults_to_material_identification() {
        let request = multipart_request("/analyze", &[Part::File("image", "slab.jpg", b"jpeg")]);
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scenario"], json!("Material Identification"));
    }

    #[tokio::test]
    async fn analyze_without_image_field_is_bad_request() {
        let request = multipart_request("/analyze", &[Part::Text("scenario", "Structural Analysis")]);
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));
    }

    #[tokio::test]
    async fn analyze_with_empty_filename_is_bad_request() {
        let request = multipart_request("/analyze", &[Part::File("image", "", b"")]);
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No file selected"}));
    }

    #[tokio::test]
    async fn analyze_with_empty_file_is_bad_request() {
        let request = multipart_request("/analyze", &[Part::File("image", "pier.png", b"")]);
        let (status, _) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn analyze_rejects_non_multipart_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = dryrun_app().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn analyze_upload_over_limit_is_rejected() {
        let app = router(Analyzer::dryrun(Arc::new(ScenarioRegistry::default())), 64);
        let large = vec![7u8; 4096];
        let request = multipart_request("/analyze", &[Part::File("image", "big.png", &large)]);
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn analyze_generation_failure_is_internal_error() {
        let request = multipart_request("/analyze", &[Part::File("image", "pier.png", b"png")]);
        let (status, body) = send(failing_app(), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "generation failed: quota exhausted"}));
    }

    #[tokio::test]
    async fn batch_analyze_returns_results_in_order() {
        let request = multipart_request(
            "/batch-analyze",
            &[
                Part::File("images", "a.png", b"aaa"),
                Part::File("images", "b.png", b""),
                Part::File("images", "c.png", b"ccc"),
            ],
        );
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scenario"], json!("Project Documentation"));
        assert_eq!(body["analyzed_images"], json!(2));
        assert_eq!(body["results"][0]["filename"], json!("a.png"));
        assert_eq!(body["results"][1]["filename"], json!("c.png"));
        assert_eq!(body["failures"][0]["index"], json!(1));
        assert_eq!(body["failures"][0]["filename"], json!("b.png"));
    }

    #[tokio::test]
    async fn batch_analyze_without_images_is_bad_request() {
        let request = multipart_request(
            "/batch-analyze",
            &[
                Part::File("images", "", b""),
                Part::Text("scenario", "Structural Analysis"),
            ],
        );
        let (status, body) = send(dryrun_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No images provided"}));
    }

    #[tokio::test]
    async fn batch_analyze_where_every_item_fails_is_internal_error() {
        let request = multipart_request(
            "/batch-analyze",
            &[
                Part::File("images", "a.png", b"aaa"),
                Part::File("images", "b.png", b"bbb"),
            ],
        );
        let (status, body) = send(failing_app(), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .map(|text| text.starts_with("all 2 batch items failed"))
            .unwrap_or(false));
    }

    #[test]
    fn api_error_status_mapping() {
        assert_eq!(
            ApiError::from(AnalysisError::validation("No file selected")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(AnalysisError::storage("denied")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(AnalysisError::BatchFailed {
                attempted: 1,
                first_error: "x".to_string()
            })
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
