use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::ImageFormat;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::utils::http::get_http_client;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

pub async fn download_media(url: &str) -> Option<Vec<u8>> {
    let client = get_http_client();
    for attempt in 0..DOWNLOAD_MAX_ATTEMPTS {
        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch media {url}: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_error(&err) || attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                    return None;
                }
                let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed for {url} with status {}: {}",
                status,
                truncate_for_log(&body, DOWNLOAD_ERROR_BODY_LIMIT)
            );
            if !should_retry_status(status) || attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                return None;
            }
            let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
            tokio::time::sleep(delay).await;
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Some(bytes.to_vec()),
            Err(err) => {
                warn!(
                    "Failed to read media bytes {url}: {err} (attempt={}/{})",
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                    return None;
                }
                let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
                tokio::time::sleep(delay).await;
            }
        }
    }

    None
}

fn looks_like_url(source: &str) -> bool {
    Url::parse(source)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Load a reference image from a local path or an http(s) URL.
pub async fn load_reference(source: &str) -> Result<Vec<u8>> {
    if looks_like_url(source) {
        return download_media(source)
            .await
            .ok_or_else(|| anyhow!("failed to download reference image from {source}"));
    }

    let path = Path::new(source);
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read reference image {}", path.display()))
}

/// Downscale oversized references and re-encode as JPEG so inline payloads
/// stay within the request size the API accepts. Images already small enough
/// pass through untouched.
pub fn prepare_reference_image(bytes: &[u8], max_dimension: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).context("failed to decode reference image")?;
    if decoded.width() <= max_dimension && decoded.height() <= max_dimension {
        return Ok(bytes.to_vec());
    }

    let resized = decoded.resize(max_dimension, max_dimension, FilterType::Triangle);
    debug!(
        "Downscaled reference image from {}x{} to {}x{}",
        decoded.width(),
        decoded.height(),
        resized.width(),
        resized.height()
    );

    let mut out = std::io::Cursor::new(Vec::new());
    resized
        .to_rgb8()
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("failed to re-encode reference image")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection_accepts_http_schemes_only() {
        assert!(looks_like_url("https://example.com/pose.jpg"));
        assert!(looks_like_url("http://example.com/pose.jpg"));
        assert!(!looks_like_url("file:///tmp/pose.jpg"));
        assert!(!looks_like_url("./references/pose.jpg"));
        assert!(!looks_like_url("pose.jpg"));
    }

    #[test]
    fn small_image_passes_through_unchanged() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(32, 32, image::Rgb([120, 80, 40]))
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        let bytes = buffer.into_inner();

        let prepared = prepare_reference_image(&bytes, 1024).unwrap();
        assert_eq!(prepared, bytes);
    }

    #[test]
    fn oversized_image_is_downscaled() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(200, 100, image::Rgb([10, 20, 30]))
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        let bytes = buffer.into_inner();

        let prepared = prepare_reference_image(&bytes, 64).unwrap();
        let reloaded = image::load_from_memory(&prepared).unwrap();
        assert!(reloaded.width() <= 64 && reloaded.height() <= 64);
    }
}
