use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use snackngo_core::collaborators::{Candidates, ExtractionError, Extractor};
use snackngo_types::models::{Field, FieldValue, Stage};
use tracing::{debug, warn};

use crate::parse;

const RESTAURANT_PROMPT: &str = "Extract: 1. Restaurant name (if shown) \
    2. Restaurant address (if shown). \
    Return as: 'Name: x, Address: y' or just what's available. \
    Do not include ', Address: y' if address is not shown.";

const INITIAL_TIMES_PROMPT: &str = "Extract the following times separately and adjust their AM/PM logically if needed. Follow these principles:\n\
    1. **Relative Consistency:** If two times appear in the same context (e.g., order time and delivery time), ensure their relationship makes sense (e.g., delivery cannot be before ordering).\n\
    2. **24-Hour Clues:** If any time is in 24-hour format (e.g., '20:45'), assume other times nearby should align (e.g., '8:17' becomes '20:17').\n\
    3. **AM/PM Priority:** If AM/PM labels exist (e.g., '8:17 PM'), trust them. If missing, infer based on activity (e.g., '9:00' with 'Evening Delivery' text → PM).\n\
    Return in this exact format:\n\
    Order placement time: [time with AM/PM]\n\
    Delivery window: [earliest time with AM/PM] - [latest time with AM/PM]";

const COMPLETION_PROMPT: &str =
    "Extract when the order was delivered/completed. Return just the time in its original format.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Screenshot references resolve relative to this directory.
    pub screenshot_dir: PathBuf,
    /// Offset that times without a date are read in.
    pub utc_offset: FixedOffset,
    /// Upper bound on one generateContent call, connect included.
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: String, screenshot_dir: PathBuf, utc_offset: FixedOffset) -> Self {
        Self {
            api_key,
            model: "gemini-1.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            screenshot_dir,
            utc_offset,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Screenshot extractor backed by the Gemini `generateContent` API.
///
/// The API key goes out as a query parameter; never log the request URL.
#[derive(Debug, Clone)]
pub struct GeminiExtractor {
    config: GeminiConfig,
    http: reqwest::Client,
}

impl GeminiExtractor {
    pub fn new(config: GeminiConfig) -> Result<Self, ExtractionError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExtractionError::Service(format!("http client setup failed: {e}")))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    /// Resolve an uploaded screenshot reference inside the screenshot directory.
    fn resolve(&self, image_ref: &str) -> Result<PathBuf, ExtractionError> {
        let relative = Path::new(image_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if image_ref.is_empty() || escapes {
            return Err(ExtractionError::Image(format!(
                "invalid screenshot reference: {image_ref}"
            )));
        }
        Ok(self.config.screenshot_dir.join(relative))
    }

    async fn load_image(&self, image_ref: &str) -> Result<InlineImage, ExtractionError> {
        let path = self.resolve(image_ref)?;
        let mime_type = mime_type(&path)
            .ok_or_else(|| ExtractionError::Image(format!("unsupported image type: {image_ref}")))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ExtractionError::Image(format!("{image_ref}: {e}")))?;
        if bytes.is_empty() {
            return Err(ExtractionError::Image(format!("{image_ref}: empty file")));
        }
        Ok(InlineImage {
            mime_type,
            data: STANDARD.encode(bytes),
        })
    }

    async fn ask(&self, image: &InlineImage, prompt: &str) -> Result<String, ExtractionError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "inline_data": { "mime_type": image.mime_type, "data": image.data } },
                    { "text": prompt },
                ]
            }]
        });

        let resp = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.request_error(e)
                } else {
                    ExtractionError::Service(format!("response decode failed: {}", e.without_url()))
                }
            })?;

        if !status.is_success() {
            return Err(ExtractionError::Service(format!(
                "http error status={} message={}",
                status.as_u16(),
                body.error_message()
            )));
        }
        if let Some(error) = &body.error {
            return Err(ExtractionError::Service(error.to_string()));
        }

        let text = body.text();
        debug!(reply = %text, "gemini reply");
        Ok(text)
    }

    fn request_error(&self, e: reqwest::Error) -> ExtractionError {
        if e.is_timeout() {
            ExtractionError::Service(format!(
                "request timed out after {}s",
                self.config.request_timeout.as_secs_f32()
            ))
        } else {
            ExtractionError::Service(format!("request failed: {}", e.without_url()))
        }
    }

    async fn extract_initial(
        &self,
        image: &InlineImage,
        reference: DateTime<FixedOffset>,
    ) -> Result<Candidates, ExtractionError> {
        let mut candidates = Candidates::new();

        let info = parse::restaurant_info(&self.ask(image, RESTAURANT_PROMPT).await?);
        if let Some(name) = info.name {
            candidates.insert(Field::RestaurantName, FieldValue::Text(name));
        }
        if let Some(address) = info.address {
            candidates.insert(Field::RestaurantAddress, FieldValue::Text(address));
        }

        let times = parse::initial_times(&self.ask(image, INITIAL_TIMES_PROMPT).await?, reference);
        let timed = [
            (Field::OrderPlacementTime, times.placement),
            (Field::EarliestEstimatedArrivalTime, times.earliest_arrival),
            (Field::LatestEstimatedArrivalTime, times.latest_arrival),
        ];
        for (field, value) in timed {
            if let Some(secs) = value {
                candidates.insert(field, FieldValue::Timestamp(secs));
            }
        }

        Ok(candidates)
    }

    async fn extract_completion(
        &self,
        image: &InlineImage,
        reference: DateTime<FixedOffset>,
    ) -> Result<Candidates, ExtractionError> {
        let reply = self.ask(image, COMPLETION_PROMPT).await?;
        let mut candidates = Candidates::new();
        if let Some(secs) = parse::completion_time(&reply, reference) {
            candidates.insert(Field::OrderCompletionTime, FieldValue::Timestamp(secs));
        }
        Ok(candidates)
    }
}

#[async_trait]
impl Extractor for GeminiExtractor {
    async fn extract(&self, image_ref: &str, stage: Stage) -> Result<Candidates, ExtractionError> {
        let image = self.load_image(image_ref).await?;
        let reference = Utc::now().with_timezone(&self.config.utc_offset);

        let candidates = match stage {
            Stage::Initial => self.extract_initial(&image, reference).await?,
            Stage::Completion => self.extract_completion(&image, reference).await?,
        };

        if candidates.is_empty() {
            warn!(image_ref, stage = stage.as_str(), "no fields read from screenshot");
            return Err(ExtractionError::NoFields);
        }
        debug!(image_ref, stage = stage.as_str(), count = candidates.len(), "screenshot read");
        Ok(candidates)
    }
}

struct InlineImage {
    mime_type: &'static str,
    data: String,
}

fn mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    error: Option<ApiError>,
}

impl GenerateResponse {
    /// Text parts of the first candidate, joined.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }

    fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(ApiError::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<i64>,
    message: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "code={code} {message}"),
            (_, Some(message)) => f.write_str(message),
            _ => f.write_str("unknown"),
        }
    }
}
