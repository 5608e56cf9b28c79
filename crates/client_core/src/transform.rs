use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{ImageMimeType, OUTPUT_SIDE_PX},
    error::ErrorKind,
    protocol::{
        Content, ContentPart, GenerateContentRequest, GenerateContentResponse,
        GoogleApiErrorBody, InlineData,
    },
};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::Settings;

const API_KEY_HEADER: &str = "x-goog-api-key";

const POLICY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
];

pub fn outpaint_instruction() -> String {
    format!(
        "Expand this image to a {side}x{side} pixel square with a 1:1 aspect ratio. \
         Keep the product centered and exactly as it appears in the original, and \
         intelligently extend the background so it fills the whole square. Match the \
         lighting and textures of the original. Return a single high-quality product \
         image.",
        side = OUTPUT_SIDE_PX
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub mime_type: ImageMimeType,
    pub data_b64: String,
    pub instruction: String,
}

impl TransformRequest {
    fn into_body(self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: None,
                parts: vec![
                    ContentPart::inline(self.mime_type.as_str(), self.data_b64),
                    ContentPart::text(self.instruction),
                ],
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("image service credential is not configured")]
    NotConfigured,
    #[error("image service rejected its credential: {0}")]
    InvalidCredential(String),
    #[error("image was flagged by safety filters ({reason})")]
    ContentPolicy { reason: String },
    #[error("network error reaching the image service: {0}")]
    Transport(String),
    #[error("no image was generated")]
    EmptyResult,
    #[error("{0}")]
    Unknown(String),
}

impl TransformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured | Self::InvalidCredential(_) => ErrorKind::Configuration,
            Self::ContentPolicy { .. } => ErrorKind::ContentPolicy,
            Self::Transport(_) => ErrorKind::Transport,
            Self::EmptyResult => ErrorKind::EmptyResult,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Message shown to the user; unknown failures surface their raw text.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unknown(message) if !message.trim().is_empty() => message.clone(),
            other => other.kind().default_message().to_string(),
        }
    }
}

#[async_trait]
pub trait TransformService: Send + Sync {
    fn ensure_configured(&self) -> Result<(), TransformError>;

    async fn generate(&self, request: TransformRequest)
        -> Result<Vec<ContentPart>, TransformError>;
}

pub fn first_inline_image(parts: &[ContentPart]) -> Option<&InlineData> {
    parts.iter().find_map(|part| part.inline_data.as_ref())
}

pub struct GeminiTransformClient {
    http: Client,
    base_url: Url,
    model: String,
    api_key: Option<String>,
}

impl GeminiTransformClient {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, url::ParseError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(&base)?,
            model: model.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, url::ParseError> {
        Self::new(
            &settings.gemini_base_url,
            settings.gemini_model.clone(),
            settings.gemini_api_key.clone(),
        )
    }

    fn endpoint(&self) -> Result<Url, TransformError> {
        self.base_url
            .join(&format!("v1beta/models/{}:generateContent", self.model))
            .map_err(|err| TransformError::Unknown(format!("invalid image service url: {err}")))
    }
}

#[async_trait]
impl TransformService for GeminiTransformClient {
    fn ensure_configured(&self) -> Result<(), TransformError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(TransformError::NotConfigured),
        }
    }

    async fn generate(
        &self,
        request: TransformRequest,
    ) -> Result<Vec<ContentPart>, TransformError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(TransformError::NotConfigured)?;
        let url = self.endpoint()?;

        info!(
            model = %self.model,
            mime_type = %request.mime_type,
            payload_b64_len = request.data_b64.len(),
            "transform: requesting outpaint"
        );

        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, api_key)
            .json(&request.into_body())
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        // reqwest reports a truncated body as a decode error.
        let body = response
            .bytes()
            .await
            .map_err(|err| TransformError::Transport(err.to_string()))?;
        if !status.is_success() {
            let error = classify_http_failure(status, &String::from_utf8_lossy(&body));
            warn!(%status, kind = ?error.kind(), "transform: service returned an error");
            return Err(error);
        }

        let parsed: GenerateContentResponse = serde_json::from_slice(&body).map_err(|err| {
            TransformError::Unknown(format!("malformed response from image service: {err}"))
        })?;

        let policy_block = blocked_reason(&parsed);
        let parts = parsed.into_first_candidate_parts();
        if first_inline_image(&parts).is_none() {
            if let Some(reason) = policy_block {
                warn!(%reason, "transform: candidate withheld by safety filters");
                return Err(TransformError::ContentPolicy { reason });
            }
        }

        info!(parts = parts.len(), "transform: response received");
        Ok(parts)
    }
}

fn blocked_reason(response: &GenerateContentResponse) -> Option<String> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone())
    {
        return Some(reason);
    }
    response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.as_deref())
        .filter(|reason| POLICY_FINISH_REASONS.contains(reason))
        .map(str::to_string)
}

fn classify_transport_error(err: reqwest::Error) -> TransformError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        TransformError::Transport(err.to_string())
    } else {
        TransformError::Unknown(err.to_string())
    }
}

fn classify_http_failure(status: StatusCode, body: &str) -> TransformError {
    let detail = serde_json::from_str::<GoogleApiErrorBody>(body)
        .ok()
        .map(|parsed| parsed.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("image service returned HTTP {}", status.as_u16()));
    let api_status = detail
        .as_ref()
        .and_then(|d| d.status.as_deref())
        .unwrap_or_default();
    let lower = message.to_ascii_lowercase();

    if lower.contains("api key")
        || lower.contains("api_key")
        || matches!(api_status, "UNAUTHENTICATED" | "PERMISSION_DENIED")
        || matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
    {
        TransformError::InvalidCredential(message)
    } else if lower.contains("safety") {
        TransformError::ContentPolicy { reason: message }
    } else {
        TransformError::Unknown(message)
    }
}

#[cfg(test)]
#[path = "tests/transform_tests.rs"]
mod tests;
