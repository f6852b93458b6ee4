use async_trait::async_trait;
use reqwest::StatusCode;

/// Failure modes of the external model calls. Retryable variants are worth
/// another attempt within the session budget; permanent ones abort the
/// session immediately.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("model overloaded: {0}")]
    Overloaded(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("blocked by safety filter: {0}")]
    SafetyBlocked(String),
    #[error("empty model response: {0}")]
    Empty(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::RateLimited(_)
                | OracleError::Overloaded(_)
                | OracleError::Timeout(_)
                | OracleError::Transport(_)
                | OracleError::Empty(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Map an HTTP status plus error-body text onto the error taxonomy. The API
/// reports most conditions both ways, so the body text is the tie-breaker
/// when the status is ambiguous.
pub fn classify_failure(status: Option<StatusCode>, detail: &str) -> OracleError {
    let lowered = detail.to_lowercase();

    if contains_any(
        &lowered,
        &["safety", "prohibited_content", "blocked", "image_safety"],
    ) {
        return OracleError::SafetyBlocked(detail.to_string());
    }
    if matches!(status, Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN))
        || contains_any(
            &lowered,
            &["api key", "permission_denied", "unauthenticated", "api_key_invalid"],
        )
    {
        return OracleError::Auth(detail.to_string());
    }
    if status == Some(StatusCode::TOO_MANY_REQUESTS)
        || contains_any(&lowered, &["resource_exhausted", "rate limit", "quota"])
    {
        return OracleError::RateLimited(detail.to_string());
    }
    if status.map(|s| s.is_server_error()).unwrap_or(false)
        || contains_any(&lowered, &["overloaded", "unavailable", "try again later"])
    {
        return OracleError::Overloaded(detail.to_string());
    }
    if status == Some(StatusCode::REQUEST_TIMEOUT) || lowered.contains("timed out") {
        return OracleError::Timeout(detail.to_string());
    }
    OracleError::Transport(detail.to_string())
}

/// One image-generation request. `reference_images` are raw encoded bytes
/// sent inline; `temperature` comes from the retry schedule, not from
/// configuration, so each attempt can cool the sampler down.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub reference_images: Vec<Vec<u8>>,
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Vision side of the model: takes images plus a task description, returns
/// whatever text the model produced. Callers own the JSON wrangling.
#[async_trait]
pub trait VisionOracle: Send + Sync {
    async fn analyze(&self, images: &[Vec<u8>], task_prompt: &str) -> Result<String, OracleError>;
}

/// Generation side of the model.
#[async_trait]
pub trait ImageOracle: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_is_retryable() {
        let err = classify_failure(Some(StatusCode::TOO_MANY_REQUESTS), "quota exceeded");
        assert!(matches!(err, OracleError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_failure_is_permanent() {
        let err = classify_failure(Some(StatusCode::FORBIDDEN), "API key not valid");
        assert!(matches!(err, OracleError::Auth(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn safety_block_wins_over_status() {
        let err = classify_failure(
            Some(StatusCode::BAD_REQUEST),
            "Candidate was blocked due to SAFETY",
        );
        assert!(matches!(err, OracleError::SafetyBlocked(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn server_errors_count_as_overloaded() {
        let err = classify_failure(Some(StatusCode::SERVICE_UNAVAILABLE), "");
        assert!(matches!(err, OracleError::Overloaded(_)));
        assert!(err.is_retryable());
    }
}
