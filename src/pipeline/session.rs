use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::analysis::schema::{PoseAnalysis, Stance};
use crate::analysis::ReferenceAnalyzer;
use crate::compat::{check_compatibility, CompatibilityLevel, CompatibilityResult};
use crate::config::CONFIG;
use crate::llm::media::{load_reference, prepare_reference_image};
use crate::llm::oracle::{GeneratedImage, GenerationRequest, ImageOracle, VisionOracle};
use crate::pipeline::prompt::{build_generation_prompt, build_grading_prompt};
use crate::pipeline::retry::{
    AttemptGrader, AttemptRecord, RetryController, RetryPolicy, SessionOutcome,
};
use crate::utils::logging::append_audit_record;
use crate::utils::timing::SessionTimer;
use crate::validation::{parse_grading_report, GradingReport, ProfileRegistry};

const SESSION_AUDIT_FILE: &str = "sessions.jsonl";

/// One unit of work: reference images in, accepted (or best-effort) image
/// out. Paths may be local files or http(s) URLs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInputs {
    pub identity_ref: String,
    pub pose_ref: String,
    pub background_ref: String,
    #[serde(default)]
    pub outfit_ref: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub extra_prompt: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub workflow: String,
    pub outcome: String,
    pub score: Option<u32>,
    pub attempts: usize,
    pub compatibility: CompatibilityLevel,
    pub degraded_analyses: Vec<String>,
    pub output_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    session_id: &'a str,
    workflow: &'a str,
    #[serde(flatten)]
    record: &'a AttemptRecord,
}

/// Grades attempts by asking the vision model to compare the generated
/// image against the session's references. Unusable grader output becomes
/// an auto-fail report rather than an error.
struct OracleGrader {
    oracle: Arc<dyn VisionOracle>,
    references: Vec<Vec<u8>>,
    prompt: String,
}

#[async_trait]
impl AttemptGrader for OracleGrader {
    async fn grade(&self, image: &GeneratedImage) -> GradingReport {
        let mut images = self.references.clone();
        images.push(image.bytes.clone());
        match self.oracle.analyze(&images, &self.prompt).await {
            Ok(raw) => parse_grading_report(&raw).unwrap_or_else(|| {
                warn!("Grading output did not match the expected schema");
                GradingReport::ungradable("schema mismatch")
            }),
            Err(err) => {
                warn!("Grading call failed: {err}");
                GradingReport::ungradable(&err.to_string())
            }
        }
    }
}

/// If the scene cannot host the requested stance at all, shoot the closest
/// stance it supports instead of burning generation attempts on an
/// impossible brief.
pub fn resolve_stance(pose: &PoseAnalysis, compat: &CompatibilityResult) -> (PoseAnalysis, bool) {
    if compat.level != CompatibilityLevel::Incompatible {
        return (pose.clone(), false);
    }
    let replacement = compat
        .alternative_stances
        .first()
        .copied()
        .unwrap_or(Stance::Stand);
    let mut adjusted = pose.clone();
    adjusted.stance = replacement;
    (adjusted, true)
}

fn session_id_for(inputs: &SessionInputs) -> String {
    let base = inputs
        .label
        .clone()
        .unwrap_or_else(|| {
            std::path::Path::new(&inputs.pose_ref)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "session".to_string())
        });
    format!("{}-{}", base, Utc::now().format("%Y%m%d%H%M%S%3f"))
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

async fn load_prepared(source: &str) -> Result<Vec<u8>> {
    let bytes = load_reference(source).await?;
    prepare_reference_image(&bytes, CONFIG.max_reference_dimension)
        .with_context(|| format!("failed to prepare reference image {source}"))
}

async fn save_output(session_id: &str, image: &GeneratedImage) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&CONFIG.output_dir)
        .await
        .context("failed to create output directory")?;
    let path = CONFIG
        .output_dir
        .join(format!("{session_id}.{}", extension_for_mime(&image.mime_type)));
    tokio::fs::write(&path, &image.bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub async fn run_session(
    vision: Arc<dyn VisionOracle>,
    generator: Arc<dyn ImageOracle>,
    registry: &ProfileRegistry,
    inputs: &SessionInputs,
) -> Result<SessionReport> {
    let workflow_name = inputs
        .workflow
        .clone()
        .unwrap_or_else(|| CONFIG.default_workflow.clone());
    let profile = registry
        .get(&workflow_name)
        .ok_or_else(|| {
            anyhow!(
                "unknown workflow '{}' (available: {})",
                workflow_name,
                registry.names().join(", ")
            )
        })?
        .clone();

    let session_id = session_id_for(inputs);
    let mut timer = SessionTimer::start(&session_id, &profile.name);

    let identity_image = load_prepared(&inputs.identity_ref).await?;
    let pose_image = load_prepared(&inputs.pose_ref).await?;
    let background_image = load_prepared(&inputs.background_ref).await?;
    let outfit_image = match &inputs.outfit_ref {
        Some(source) => Some(load_prepared(source).await?),
        None => None,
    };

    let analyzer = ReferenceAnalyzer::new(Arc::clone(&vision));
    let pose = analyzer.analyze_pose(&pose_image).await;
    let background = analyzer.analyze_background(&background_image).await;
    let expression = analyzer.analyze_expression(&identity_image).await;
    let outfit = analyzer
        .analyze_hair_outfit(outfit_image.as_deref().unwrap_or(&identity_image))
        .await;

    let mut degraded = Vec::new();
    for (name, is_degraded) in [
        ("pose", pose.is_degraded()),
        ("background", background.is_degraded()),
        ("expression", expression.is_degraded()),
        ("hair_outfit", outfit.is_degraded()),
    ] {
        if is_degraded {
            degraded.push(name.to_string());
        }
    }

    let compat = check_compatibility(&pose.value, &background.value);
    info!(
        "Session {session_id}: {} in {} is {:?} (score {})",
        pose.value.stance.as_str(),
        background.value.scene_type,
        compat.level,
        compat.score
    );
    let (pose_for_shoot, substituted) = resolve_stance(&pose.value, &compat);
    if substituted {
        warn!(
            "Session {session_id}: substituted stance {} for {}",
            pose_for_shoot.stance.as_str(),
            pose.value.stance.as_str()
        );
    }

    let base_prompt = build_generation_prompt(
        &pose_for_shoot,
        &background.value,
        &expression.value,
        &outfit.value,
        &compat,
        inputs.extra_prompt.as_deref(),
    );

    let mut generation_references = vec![identity_image.clone(), background_image.clone()];
    if let Some(outfit_bytes) = &outfit_image {
        generation_references.push(outfit_bytes.clone());
    }
    let request = GenerationRequest {
        prompt: base_prompt,
        reference_images: generation_references,
        aspect_ratio: Some(CONFIG.aspect_ratio.clone()),
        image_size: Some(CONFIG.image_size.clone()),
        temperature: CONFIG.initial_temperature,
    };

    let mut grading_references = vec![identity_image, pose_image, background_image];
    if let Some(outfit_bytes) = outfit_image {
        grading_references.push(outfit_bytes);
    }
    let grader = OracleGrader {
        oracle: Arc::clone(&vision),
        references: grading_references,
        prompt: build_grading_prompt(&profile),
    };

    let controller = RetryController::new(RetryPolicy::from_config(), &profile);
    let (outcome, records) = controller.run(generator.as_ref(), &grader, &request).await;

    for record in &records {
        let entry = AuditEntry {
            session_id: &session_id,
            workflow: &profile.name,
            record,
        };
        if let Err(err) = append_audit_record(SESSION_AUDIT_FILE, &entry) {
            warn!("Failed to append session audit record: {err}");
        }
    }

    let attempts = records.len();
    let outcome_label = outcome.label();
    let report = match outcome {
        SessionOutcome::Passed {
            image,
            validation,
            attempt,
        } => {
            let output_path = save_output(&session_id, &image).await?;
            info!(
                "Session {session_id} passed on attempt {} with score {} -> {}",
                attempt + 1,
                validation.total_score,
                output_path.display()
            );
            timer.complete(outcome_label, Some(format!("score={}", validation.total_score)));
            SessionReport {
                session_id,
                workflow: profile.name.clone(),
                outcome: outcome_label.to_string(),
                score: Some(validation.total_score),
                attempts,
                compatibility: compat.level,
                degraded_analyses: degraded,
                output_path: Some(output_path),
            }
        }
        SessionOutcome::BestEffort {
            image,
            validation,
            attempt,
        } => {
            let output_path = save_output(&session_id, &image).await?;
            warn!(
                "Session {session_id} exhausted retries; keeping attempt {} with score {} -> {}",
                attempt + 1,
                validation.total_score,
                output_path.display()
            );
            timer.complete(
                outcome_label,
                Some(format!("score={}", validation.total_score)),
            );
            SessionReport {
                session_id,
                workflow: profile.name.clone(),
                outcome: outcome_label.to_string(),
                score: Some(validation.total_score),
                attempts,
                compatibility: compat.level,
                degraded_analyses: degraded,
                output_path: Some(output_path),
            }
        }
        SessionOutcome::Failed { reason } => {
            warn!("Session {session_id} produced no image: {reason}");
            timer.complete(outcome_label, Some(reason.clone()));
            SessionReport {
                session_id,
                workflow: profile.name.clone(),
                outcome: outcome_label.to_string(),
                score: None,
                attempts,
                compatibility: compat.level,
                degraded_analyses: degraded,
                output_path: None,
            }
        }
    };

    Ok(report)
}

/// Run independent sessions concurrently. Sessions share nothing mutable
/// except the key pool inside the oracles, so the only coordination here is
/// the concurrency cap and the report sink.
pub async fn run_batch(
    vision: Arc<dyn VisionOracle>,
    generator: Arc<dyn ImageOracle>,
    registry: Arc<ProfileRegistry>,
    batch: Vec<SessionInputs>,
    concurrency: usize,
) -> Vec<SessionReport> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let reports: Arc<Mutex<Vec<SessionReport>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for inputs in batch {
        let vision = Arc::clone(&vision);
        let generator = Arc::clone(&generator);
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);
        let reports = Arc::clone(&reports);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            match run_session(vision, generator, registry.as_ref(), &inputs).await {
                Ok(report) => reports.lock().push(report),
                Err(err) => {
                    warn!(
                        "Session for pose {} failed before generation: {err:#}",
                        inputs.pose_ref
                    );
                }
            }
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            warn!("Session task panicked: {err}");
        }
    }

    let mut collected = std::mem::take(&mut *reports.lock());
    collected.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::schema::{Affordance, BackgroundAnalysis};

    fn background(scene: &str, provides: Vec<Affordance>, supported: Vec<Stance>) -> BackgroundAnalysis {
        BackgroundAnalysis {
            scene_type: scene.to_string(),
            provides,
            supported_stances: supported,
            potential_seating_locations: Vec::new(),
            sit_on: String::new(),
            notes: String::new(),
            confidence: 0.9,
        }
    }

    #[test]
    fn incompatible_stance_is_replaced_by_best_alternative() {
        let mut pose = PoseAnalysis::fallback();
        pose.stance = Stance::Sit;
        let scene = background("crosswalk", vec![], vec![Stance::Stand, Stance::Walk]);
        let compat = check_compatibility(&pose, &scene);

        let (resolved, substituted) = resolve_stance(&pose, &compat);
        assert!(substituted);
        assert_eq!(resolved.stance, Stance::Stand);
    }

    #[test]
    fn compatible_stance_is_left_alone() {
        let mut pose = PoseAnalysis::fallback();
        pose.stance = Stance::Sit;
        let scene = background(
            "cafe",
            vec![Affordance::Seating],
            vec![Stance::Stand, Stance::Sit],
        );
        let compat = check_compatibility(&pose, &scene);

        let (resolved, substituted) = resolve_stance(&pose, &compat);
        assert!(!substituted);
        assert_eq!(resolved.stance, Stance::Sit);
    }
}
