use std::env;
use std::path::PathBuf;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub gemini_api_keys: Vec<String>,
    pub gemini_vision_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub initial_temperature: f32,
    pub temperature_step: f32,
    pub temperature_floor: f32,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    pub aspect_ratio: String,
    pub image_size: String,
    pub max_reference_dimension: u32,
    pub workflow_profiles_path: PathBuf,
    pub default_workflow: String,
    pub output_dir: PathBuf,
    pub batch_concurrency: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn resolve_gemini_api_keys() -> Vec<String> {
    let mut keys = env_csv("GEMINI_API_KEYS");
    if keys.is_empty() {
        let single = env_string("GEMINI_API_KEY", "");
        if !single.trim().is_empty() {
            keys.push(single.trim().to_string());
        }
    }
    keys
}

impl Config {
    pub fn load() -> Result<Self> {
        let gemini_api_keys = resolve_gemini_api_keys();
        if gemini_api_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "GEMINI_API_KEYS (or GEMINI_API_KEY) is required"
            ));
        }

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_keys,
            gemini_vision_model: env_string("GEMINI_VISION_MODEL", "gemini-2.0-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-3-pro-image-preview"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.2),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            initial_temperature: env_f32("GENERATION_INITIAL_TEMPERATURE", 1.0),
            temperature_step: env_f32("GENERATION_TEMPERATURE_STEP", 0.15),
            temperature_floor: env_f32("GENERATION_TEMPERATURE_FLOOR", 0.4),
            max_retries: env_u32("GENERATION_MAX_RETRIES", 2),
            retry_backoff_seconds: env_u64("GENERATION_RETRY_BACKOFF_SECONDS", 3),
            aspect_ratio: env_string("GENERATION_ASPECT_RATIO", "3:4"),
            image_size: env_string("GENERATION_IMAGE_SIZE", "2K"),
            max_reference_dimension: env_u32("MAX_REFERENCE_DIMENSION", 1536),
            workflow_profiles_path: PathBuf::from(env_string(
                "WORKFLOW_PROFILES_PATH",
                "workflow_profiles.json",
            )),
            default_workflow: env_string("DEFAULT_WORKFLOW", "casual_influencer"),
            output_dir: PathBuf::from(env_string("OUTPUT_DIR", "output")),
            batch_concurrency: env_usize("BATCH_CONCURRENCY", 3).max(1),
        })
    }
}
