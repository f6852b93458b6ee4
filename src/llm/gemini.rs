use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::CONFIG;
use crate::llm::keypool::KeyPool;
use crate::llm::media::detect_mime_type;
use crate::llm::oracle::{
    classify_failure, GeneratedImage, GenerationRequest, ImageOracle, OracleError, VisionOracle,
};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_oracle_timing;

const ANALYSIS_SYSTEM_PROMPT: &str =
    "You are a meticulous fashion photography analyst. Reply with a single JSON object and nothing else.";

const GENERATION_SYSTEM_PROMPT: &str =
    "Generate a photograph based on the prompt and reference images. CRITICAL: the response must be an image, NOT TEXT.";

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

fn redact_api_key(text: &str, key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, "[redacted]")
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_safety_settings() -> Vec<Value> {
    let profile = CONFIG.gemini_safety_settings.as_str();
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using permissive defaults.",
                profile
            );
            "OFF"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": threshold }),
    ]
}

fn build_image_config(request: &GenerationRequest) -> Option<Value> {
    let mut map = Map::new();

    if let Some(aspect_ratio) = request.aspect_ratio.as_deref() {
        let trimmed = aspect_ratio.trim();
        if !trimmed.is_empty() {
            map.insert("aspectRatio".to_string(), json!(trimmed));
        }
    }

    if let Some(image_size) = request.image_size.as_deref() {
        let trimmed = image_size.trim();
        if !trimmed.is_empty() {
            map.insert("imageSize".to_string(), json!(trimmed));
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let mut text_parts = 0usize;
        let mut image_parts = 0usize;
        for content in contents {
            let parts = content
                .get("parts")
                .and_then(|value| value.as_array())
                .map(|parts| parts.as_slice())
                .unwrap_or(&[]);
            for part in parts {
                if part.get("text").is_some() {
                    text_parts += 1;
                } else if part.get("inlineData").is_some() {
                    image_parts += 1;
                }
            }
        }
        summary.insert("textParts".to_string(), json!(text_parts));
        summary.insert("imageParts".to_string(), json!(image_parts));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    Value::Object(summary)
}

fn summarize_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    let candidates = response.candidates.as_deref().unwrap_or(&[]);
    for candidate in candidates {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    match part {
                        GeminiPart::Text { text } => {
                            text_parts += 1;
                            if text_preview.is_none() && !text.trim().is_empty() {
                                text_preview = Some(truncate_for_log(text, 200));
                            }
                        }
                        GeminiPart::InlineData { inline_data } => {
                            if inline_data.mime_type.starts_with("image/") {
                                image_parts += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    json!({
        "candidates": candidates.len(),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn build_parts(text: &str, images: &[Vec<u8>], text_after_media: bool) -> Vec<Value> {
    let mut parts = Vec::new();
    let text_part = json!({ "text": text });

    if !text_after_media {
        parts.push(text_part.clone());
    }

    for image_data in images {
        let mime_type = detect_mime_type(image_data).unwrap_or_else(|| "image/png".to_string());
        let encoded = general_purpose::STANDARD.encode(image_data);
        parts.push(json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": encoded
            }
        }));
    }

    if text_after_media {
        parts.push(text_part);
    }

    parts
}

fn extract_text(response: &GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    if let GeminiPart::Text { text } = part {
                        if !text.trim().is_empty() {
                            text_parts.push(text.clone());
                        }
                    }
                }
            }
        }
    }
    text_parts.join("\n")
}

fn extract_images(response: &GeminiResponse) -> Vec<GeneratedImage> {
    let mut images = Vec::new();
    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    if let GeminiPart::InlineData { inline_data } = part {
                        if inline_data.mime_type.starts_with("image/") {
                            if let Ok(bytes) =
                                general_purpose::STANDARD.decode(inline_data.data.as_bytes())
                            {
                                images.push(GeneratedImage {
                                    bytes,
                                    mime_type: inline_data.mime_type.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    images
}

fn blocked_reason(response: &GeminiResponse) -> Option<String> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Some(reason.clone());
        }
    }
    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        if let Some(reason) = &candidate.finish_reason {
            if matches!(reason.as_str(), "SAFETY" | "PROHIBITED_CONTENT" | "IMAGE_SAFETY") {
                return Some(reason.clone());
            }
        }
    }
    None
}

/// Gemini-backed implementation of both oracle traits. Keys rotate through
/// the shared pool per request, so concurrent sessions spread across keys.
pub struct GeminiOracle {
    keys: Arc<KeyPool>,
}

impl GeminiOracle {
    pub fn new(keys: Arc<KeyPool>) -> Self {
        GeminiOracle { keys }
    }

    async fn call_api(&self, model: &str, payload: Value) -> Result<GeminiResponse, OracleError> {
        let client = get_http_client();

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, payload = %summarize_payload(&payload));
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let key = self.keys.next_key();
            let url = format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                model, key
            );

            let response = match client
                .post(&url)
                .timeout(Duration::from_secs(90))
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = redact_api_key(&err.to_string(), key);
                    let classified = if err.is_timeout() {
                        OracleError::Timeout(err_text.clone())
                    } else {
                        OracleError::Transport(err_text.clone())
                    };
                    let should_retry =
                        classified.is_retryable() && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                    warn!(
                        "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                        err_text,
                        err.is_timeout(),
                        err.is_connect(),
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(classified);
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let (message, body_summary) = summarize_error_body(&body);
                let detail = message.unwrap_or_else(|| body_summary.clone());
                let classified = classify_failure(Some(status), &detail);
                let should_retry =
                    classified.is_retryable() && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini API error: status={}, body={}, retrying={}",
                    status, body_summary, should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(classified);
            }

            let value = response
                .json::<GeminiResponse>()
                .await
                .map_err(|err| OracleError::Transport(redact_api_key(&err.to_string(), key)))?;

            if let Some(reason) = blocked_reason(&value) {
                return Err(OracleError::SafetyBlocked(reason));
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(target: "llm.gemini", model = model, response = %summarize_response(&value));
            }
            return Ok(value);
        }
    }
}

#[async_trait]
impl VisionOracle for GeminiOracle {
    async fn analyze(&self, images: &[Vec<u8>], task_prompt: &str) -> Result<String, OracleError> {
        let parts = build_parts(task_prompt, images, true);
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": ANALYSIS_SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": CONFIG.gemini_temperature,
                "topK": CONFIG.gemini_top_k,
                "topP": CONFIG.gemini_top_p,
                "maxOutputTokens": CONFIG.gemini_max_output_tokens,
            },
            "safetySettings": build_safety_settings(),
        });

        let model = CONFIG.gemini_vision_model.clone();
        log_oracle_timing("gemini", &model, "analyze", || async {
            let response = self.call_api(&model, payload).await?;
            let text = extract_text(&response);
            if text.trim().is_empty() {
                return Err(OracleError::Empty(format!(
                    "no text returned by {model} for analysis task"
                )));
            }
            Ok(text)
        })
        .await
    }
}

#[async_trait]
impl ImageOracle for GeminiOracle {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, OracleError> {
        let parts = build_parts(&request.prompt, &request.reference_images, false);
        let mut generation_config = json!({
            "responseModalities": ["TEXT", "IMAGE"],
            "temperature": request.temperature,
        });
        if let Some(image_config) = build_image_config(request) {
            if let Some(config_object) = generation_config.as_object_mut() {
                config_object.insert("imageConfig".to_string(), image_config);
            }
        }

        let payload = json!({
            "systemInstruction": { "parts": [{ "text": GENERATION_SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
            "safetySettings": build_safety_settings(),
        });

        let model = CONFIG.gemini_image_model.clone();
        log_oracle_timing("gemini", &model, "generate", || async {
            let response = self.call_api(&model, payload).await?;
            let mut images = extract_images(&response);
            if images.is_empty() {
                let text = extract_text(&response);
                return Err(OracleError::Empty(format!(
                    "no image returned by {model}: {}",
                    truncate_for_log(&text, 200)
                )));
            }
            Ok(images.remove(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_hides_keys_anywhere_in_text() {
        let redacted = redact_api_key("error calling ?key=secret123: denied", "secret123");
        assert!(!redacted.contains("secret123"));
        assert!(redacted.contains("[redacted]"));
    }

    #[test]
    fn parts_keep_text_first_for_generation() {
        let parts = build_parts("a prompt", &[vec![0u8; 4]], false);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].get("text").is_some());
        assert!(parts[1].get("inlineData").is_some());
    }

    #[test]
    fn extracts_inline_images_and_drops_text() {
        let encoded = general_purpose::STANDARD.encode(b"img-bytes");
        let raw = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here is your image" },
                        { "inlineData": { "mimeType": "image/png", "data": encoded } }
                    ]
                }
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        let images = extract_images(&response);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].bytes, b"img-bytes");
    }

    #[test]
    fn safety_finish_reason_is_reported_as_block() {
        let raw = json!({
            "candidates": [{ "finishReason": "IMAGE_SAFETY" }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(blocked_reason(&response).as_deref(), Some("IMAGE_SAFETY"));
    }
}
