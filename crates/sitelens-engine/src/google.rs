use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use crate::transport::{
    api_base_from_env, non_empty_env, response_json_or_error, send_with_transport_retries,
    TransportPolicy,
};
use crate::{BlobStore, TextGenerator, VisionDetector};

const OCTET_STREAM: &str = "application/octet-stream";

/// Cloud Storage JSON API media uploads into one bucket.
pub struct CloudStorage {
    api_base: String,
    bucket: String,
    http: HttpClient,
    policy: TransportPolicy,
}

impl CloudStorage {
    pub fn new(bucket: impl Into<String>, policy: TransportPolicy) -> Self {
        Self {
            api_base: api_base_from_env("GCS_API_BASE", "https://storage.googleapis.com"),
            bucket: bucket.into(),
            http: HttpClient::new(),
            policy,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn access_token() -> Option<String> {
        non_empty_env("GCS_ACCESS_TOKEN").or_else(|| non_empty_env("GOOGLE_OAUTH_ACCESS_TOKEN"))
    }

    fn upload_endpoint(&self) -> String {
        format!("{}/upload/storage/v1/b/{}/o", self.api_base, self.bucket)
    }

    fn locator(&self, object_name: &str) -> String {
        format!("gs://{}/{}", self.bucket, object_name)
    }
}

#[async_trait]
impl BlobStore for CloudStorage {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        let Some(token) = Self::access_token() else {
            bail!("GCS_ACCESS_TOKEN or GOOGLE_OAUTH_ACCESS_TOKEN not set");
        };
        let endpoint = self.upload_endpoint();
        let content_type = content_type_for(&bytes);
        let response = send_with_transport_retries("Cloud Storage", &self.policy, || {
            self.http
                .post(&endpoint)
                .query(&[("uploadType", "media"), ("name", path)])
                .bearer_auth(&token)
                .header(CONTENT_TYPE, content_type)
                .body(bytes.clone())
        })
        .await?;
        let payload = response_json_or_error("Cloud Storage", response).await?;
        let stored_name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(path);
        Ok(self.locator(stored_name))
    }
}

/// Sniffs the image format from magic bytes; unknown payloads upload as octet-stream.
pub(crate) fn content_type_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or(OCTET_STREAM)
}

enum VisionCredential {
    ApiKey(String),
    Bearer(String),
}

/// Cloud Vision `images:annotate`, one feature per request.
pub struct CloudVision {
    api_base: String,
    http: HttpClient,
    policy: TransportPolicy,
}

impl CloudVision {
    pub fn new(policy: TransportPolicy) -> Self {
        Self {
            api_base: api_base_from_env("VISION_API_BASE", "https://vision.googleapis.com/v1"),
            http: HttpClient::new(),
            policy,
        }
    }

    fn credential() -> Option<VisionCredential> {
        non_empty_env("GOOGLE_VISION_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .map(VisionCredential::ApiKey)
            .or_else(|| non_empty_env("GOOGLE_OAUTH_ACCESS_TOKEN").map(VisionCredential::Bearer))
    }

    fn endpoint(&self) -> String {
        format!("{}/images:annotate", self.api_base)
    }

    fn annotate_payload(locator: &str, feature: &str) -> Value {
        let source = if locator.starts_with("gs://") {
            json!({ "gcsImageUri": locator })
        } else {
            json!({ "imageUri": locator })
        };
        json!({
            "requests": [{
                "image": { "source": source },
                "features": [{ "type": feature }],
            }]
        })
    }

    fn extract_annotations(response_payload: &Value, field: &str) -> Result<Vec<Value>> {
        let Some(response) = response_payload
            .get("responses")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            bail!("Vision returned no responses");
        };
        if let Some(error) = response.get("error").and_then(Value::as_object) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("Vision annotate error ({code}): {message}");
        }
        Ok(response
            .get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn annotate(&self, locator: &str, feature: &str, field: &str) -> Result<Vec<Value>> {
        let Some(credential) = Self::credential() else {
            bail!("GOOGLE_VISION_API_KEY or GOOGLE_API_KEY or GOOGLE_OAUTH_ACCESS_TOKEN not set");
        };
        let endpoint = self.endpoint();
        let payload = Self::annotate_payload(locator, feature);
        let response = send_with_transport_retries("Vision", &self.policy, || {
            let request = self.http.post(&endpoint).json(&payload);
            match &credential {
                VisionCredential::ApiKey(key) => request.query(&[("key", key.as_str())]),
                VisionCredential::Bearer(token) => request.bearer_auth(token),
            }
        })
        .await?;
        let response_payload = response_json_or_error("Vision", response).await?;
        Self::extract_annotations(&response_payload, field)
    }
}

#[async_trait]
impl VisionDetector for CloudVision {
    fn name(&self) -> &str {
        "google-vision"
    }

    async fn label_detection(&self, locator: &str) -> Result<Vec<Value>> {
        self.annotate(locator, "LABEL_DETECTION", "labelAnnotations")
            .await
    }

    async fn text_detection(&self, locator: &str) -> Result<Vec<Value>> {
        self.annotate(locator, "TEXT_DETECTION", "textAnnotations")
            .await
    }

    async fn object_localization(&self, locator: &str) -> Result<Vec<Value>> {
        self.annotate(
            locator,
            "OBJECT_LOCALIZATION",
            "localizedObjectAnnotations",
        )
        .await
    }
}

/// Gemini `generateContent` with a single text part.
pub struct GeminiGenerator {
    api_base: String,
    model: String,
    http: HttpClient,
    policy: TransportPolicy,
}

impl GeminiGenerator {
    pub fn new(model: impl Into<String>, policy: TransportPolicy) -> Self {
        Self {
            api_base: api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            model: model.into(),
            http: HttpClient::new(),
            policy,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn request_payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }]
        })
    }

    fn extract_text(response_payload: &Value) -> Result<String> {
        let text = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            return Ok(text);
        }
        if let Some(reason) = response_payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            bail!("Gemini blocked the prompt ({reason})");
        }
        bail!("Gemini returned no text");
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&self.model);
        let payload = Self::request_payload(prompt);
        let response = send_with_transport_retries("Gemini", &self.policy, || {
            self.http
                .post(&endpoint)
                .query(&[("key", api_key.as_str())])
                .json(&payload)
        })
        .await?;
        let response_payload = response_json_or_error("Gemini", response).await?;
        Self::extract_text(&response_payload)
    }
}
