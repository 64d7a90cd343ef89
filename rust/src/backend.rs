use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::GenerationError;

/// What one backend call asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    /// Slot this call serves. `None` when one call is shared by a whole batch.
    pub slot: Option<usize>,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_images: Option<u32>,
}

/// A remote text-to-image service. Returns the ordered base64 payloads of one call.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &BackendRequest) -> Result<Vec<String>, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub images_field: String,
    pub send_dimensions: bool,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn request_body(&self, request: &BackendRequest) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        if self.config.send_dimensions {
            body.insert("width".to_string(), Value::from(request.width));
            body.insert("height".to_string(), Value::from(request.height));
        }
        if let Some(num_images) = request.num_images {
            body.insert("num_images".to_string(), Value::from(num_images));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ImageBackend for HttpBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<Vec<String>, GenerationError> {
        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .json(&self.request_body(request));
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        debug!(
            slot = ?request.slot,
            width = request.width,
            height = request.height,
            endpoint = %self.config.endpoint,
            "sending generation request"
        );
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| GenerationError::Malformed(err.to_string()))?;
        extract_payloads(&body, &self.config.images_field)
    }
}

/// Pulls the payload list out of a response body.
///
/// Entries may be bare base64 strings or objects carrying one under
/// `b64_json`, `base64` or `image`.
pub fn extract_payloads(body: &Value, field: &str) -> Result<Vec<String>, GenerationError> {
    let Some(items) = body.get(field).and_then(Value::as_array) else {
        return Err(GenerationError::Malformed(format!(
            "expected an array under {field:?}"
        )));
    };

    items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            payload_text(item).map(ToOwned::to_owned).ok_or_else(|| {
                GenerationError::Malformed(format!("entry {position} is not an image payload"))
            })
        })
        .collect()
}

/// The payload belonging to slot `index`. Empty strings count as missing.
pub fn select_payload(payloads: &[String], index: usize) -> Result<String, GenerationError> {
    payloads
        .get(index)
        .filter(|payload| !payload.trim().is_empty())
        .cloned()
        .ok_or(GenerationError::MissingPayload(index))
}

fn payload_text(item: &Value) -> Option<&str> {
    match item {
        Value::String(text) => Some(text),
        Value::Object(map) => ["b64_json", "base64", "image"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    }
}
