use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::llm::oracle::{GeneratedImage, GenerationRequest, ImageOracle};
use crate::pipeline::prompt::apply_enhancements;
use crate::validation::{
    enhancement_directives, evaluate, GradingReport, ValidationResult, WorkflowProfile,
};

/// Grades one generated attempt against the session's references. Infallible
/// by contract: an unusable grading pass comes back as an auto-fail report.
#[async_trait]
pub trait AttemptGrader: Send + Sync {
    async fn grade(&self, image: &GeneratedImage) -> GradingReport;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_temperature: f32,
    pub temperature_step: f32,
    pub temperature_floor: f32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config() -> Self {
        RetryPolicy {
            max_retries: CONFIG.max_retries,
            initial_temperature: CONFIG.initial_temperature,
            temperature_step: CONFIG.temperature_step,
            temperature_floor: CONFIG.temperature_floor,
            backoff_base: Duration::from_secs(CONFIG.retry_backoff_seconds),
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Sampler temperature cools by a fixed step per attempt, never below
    /// the floor.
    pub fn temperature_for(&self, attempt: u32) -> f32 {
        (self.initial_temperature - self.temperature_step * attempt as f32)
            .max(self.temperature_floor)
    }

    /// Linear backoff, scaled by the attempt index.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }
}

/// One row of the session's append-only audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub temperature: f32,
    pub prompt: String,
    pub generated: bool,
    pub score: Option<u32>,
    pub passed: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// First attempt to clear validation wins, even if an earlier failing
    /// attempt scored higher.
    Passed {
        image: GeneratedImage,
        validation: ValidationResult,
        attempt: u32,
    },
    /// Nothing passed; this is the best-scoring attempt that generated.
    BestEffort {
        image: GeneratedImage,
        validation: ValidationResult,
        attempt: u32,
    },
    /// No attempt produced an image at all.
    Failed { reason: String },
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Passed { .. } => "passed",
            SessionOutcome::BestEffort { .. } => "best_effort",
            SessionOutcome::Failed { .. } => "failed",
        }
    }
}

fn terminal_from_best(
    best: Option<(u32, GeneratedImage, ValidationResult)>,
    reason: String,
) -> SessionOutcome {
    match best {
        Some((attempt, image, validation)) => SessionOutcome::BestEffort {
            image,
            validation,
            attempt,
        },
        None => SessionOutcome::Failed { reason },
    }
}

pub struct RetryController<'a> {
    policy: RetryPolicy,
    profile: &'a WorkflowProfile,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: RetryPolicy, profile: &'a WorkflowProfile) -> Self {
        RetryController { policy, profile }
    }

    /// Drive generate, validate, enhance until something passes or the
    /// budget runs out. Always returns a terminal outcome; generation errors
    /// become recorded attempts, never bubbled errors.
    pub async fn run(
        &self,
        generator: &dyn ImageOracle,
        grader: &dyn AttemptGrader,
        request: &GenerationRequest,
    ) -> (SessionOutcome, Vec<AttemptRecord>) {
        let base_prompt = request.prompt.clone();
        let total_attempts = self.policy.total_attempts();
        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut best: Option<(u32, GeneratedImage, ValidationResult)> = None;
        let mut prompt = base_prompt.clone();

        for attempt in 0..total_attempts {
            if attempt > 0 {
                let delay = self.policy.backoff_for(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let temperature = self.policy.temperature_for(attempt);
            let mut attempt_request = request.clone();
            attempt_request.prompt = prompt.clone();
            attempt_request.temperature = temperature;

            let image = match generator.generate(&attempt_request).await {
                Ok(image) => image,
                Err(err) => {
                    warn!(
                        "Generation attempt {}/{} failed: {err}",
                        attempt + 1,
                        total_attempts
                    );
                    records.push(AttemptRecord {
                        attempt,
                        temperature,
                        prompt: prompt.clone(),
                        generated: false,
                        score: None,
                        passed: false,
                        error: Some(err.to_string()),
                        recorded_at: Utc::now(),
                    });
                    if err.is_permanent() {
                        return (
                            terminal_from_best(best, format!("generation aborted: {err}")),
                            records,
                        );
                    }
                    continue;
                }
            };

            let report = grader.grade(&image).await;
            let validation = evaluate(self.profile, &report);
            info!(
                "Attempt {}/{} scored {} (grade {:?}, tier {:?}, passed={})",
                attempt + 1,
                total_attempts,
                validation.total_score,
                validation.grade,
                validation.tier,
                validation.passed
            );
            records.push(AttemptRecord {
                attempt,
                temperature,
                prompt: prompt.clone(),
                generated: true,
                score: Some(validation.total_score),
                passed: validation.passed,
                error: None,
                recorded_at: Utc::now(),
            });

            if validation.passed {
                return (
                    SessionOutcome::Passed {
                        image,
                        validation,
                        attempt,
                    },
                    records,
                );
            }

            let improves = best
                .as_ref()
                .map(|(_, _, incumbent)| validation.total_score > incumbent.total_score)
                .unwrap_or(true);
            if improves {
                best = Some((attempt, image, validation.clone()));
            }

            if !validation.retryable {
                warn!(
                    "Validation is not retryable ({}); stopping early",
                    validation.auto_fail_reasons.join("; ")
                );
                return (
                    terminal_from_best(best, "non-retryable validation failure".to_string()),
                    records,
                );
            }

            if attempt + 1 < total_attempts {
                let failed = validation.failed_criteria();
                let directives = enhancement_directives(self.profile, &failed);
                prompt = apply_enhancements(&base_prompt, &directives);
            }
        }

        (
            terminal_from_best(best, "all generation attempts failed".to_string()),
            records,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::llm::oracle::OracleError;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_temperature: 1.0,
            temperature_step: 0.3,
            temperature_floor: 0.5,
            backoff_base: Duration::ZERO,
        }
    }

    fn image() -> GeneratedImage {
        GeneratedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "base prompt".to_string(),
            reference_images: vec![],
            aspect_ratio: None,
            image_size: None,
            temperature: 1.0,
        }
    }

    fn report_at(profile: &WorkflowProfile, score: u32) -> GradingReport {
        GradingReport {
            scores: profile
                .weights
                .keys()
                .map(|name| (name.clone(), score))
                .collect::<BTreeMap<_, _>>(),
            ..GradingReport::default()
        }
    }

    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<GeneratedImage, OracleError>>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        temperatures: Mutex<Vec<f32>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<GeneratedImage, OracleError>>) -> Self {
            ScriptedGenerator {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                temperatures: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageOracle for ScriptedGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GeneratedImage, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().push(request.prompt.clone());
            self.temperatures.lock().push(request.temperature);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(image()))
        }
    }

    struct ScriptedGrader {
        reports: Mutex<VecDeque<GradingReport>>,
    }

    impl ScriptedGrader {
        fn new(reports: Vec<GradingReport>) -> Self {
            ScriptedGrader {
                reports: Mutex::new(reports.into()),
            }
        }
    }

    #[async_trait]
    impl AttemptGrader for ScriptedGrader {
        async fn grade(&self, _: &GeneratedImage) -> GradingReport {
            self.reports
                .lock()
                .pop_front()
                .unwrap_or_else(|| GradingReport::ungradable("script exhausted"))
        }
    }

    #[tokio::test]
    async fn budget_bounds_attempts_even_when_everything_fails_validation() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![Ok(image()), Ok(image()), Ok(image())]);
        let grader = ScriptedGrader::new(vec![
            report_at(&profile, 60),
            report_at(&profile, 65),
            report_at(&profile, 62),
        ]);
        let controller = RetryController::new(test_policy(), &profile);

        let (outcome, records) = controller.run(&generator, &grader, &request()).await;

        assert_eq!(generator.call_count(), 3);
        assert_eq!(records.len(), 3);
        match outcome {
            SessionOutcome::BestEffort {
                attempt,
                validation,
                ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(validation.total_score, 65);
            }
            other => panic!("expected best-effort outcome, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn first_passing_attempt_wins_immediately() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![Ok(image())]);
        let grader = ScriptedGrader::new(vec![report_at(&profile, 88)]);
        let controller = RetryController::new(test_policy(), &profile);

        let (outcome, records) = controller.run(&generator, &grader, &request()).await;

        assert_eq!(generator.call_count(), 1);
        assert_eq!(records.len(), 1);
        assert!(records[0].passed);
        assert!(matches!(outcome, SessionOutcome::Passed { attempt: 0, .. }));
    }

    #[tokio::test]
    async fn permanent_generation_error_aborts_without_spending_budget() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![Err(OracleError::Auth(
            "API key not valid".to_string(),
        ))]);
        let grader = ScriptedGrader::new(vec![]);
        let controller = RetryController::new(test_policy(), &profile);

        let (outcome, records) = controller.run(&generator, &grader, &request()).await;

        assert_eq!(generator.call_count(), 1);
        assert_eq!(records.len(), 1);
        assert!(!records[0].generated);
        match outcome {
            SessionOutcome::Failed { reason } => assert!(reason.contains("aborted")),
            other => panic!("expected failed outcome, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn retryable_generation_error_consumes_one_attempt() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![
            Err(OracleError::RateLimited("quota".to_string())),
            Ok(image()),
        ]);
        let grader = ScriptedGrader::new(vec![report_at(&profile, 88)]);
        let controller = RetryController::new(test_policy(), &profile);

        let (outcome, records) = controller.run(&generator, &grader, &request()).await;

        assert_eq!(generator.call_count(), 2);
        assert!(matches!(outcome, SessionOutcome::Passed { attempt: 1, .. }));
        assert!(records[0].error.is_some());
        assert!(records[0].score.is_none());
    }

    #[tokio::test]
    async fn non_retryable_validation_stops_early_with_best_effort() {
        let profile = WorkflowProfile::casual_influencer();
        let mut fatal = report_at(&profile, 80);
        fatal.auto_fail = true;
        fatal.auto_fail_reasons = vec!["unusable reference image".to_string()];

        let generator = ScriptedGenerator::new(vec![Ok(image()), Ok(image()), Ok(image())]);
        let grader = ScriptedGrader::new(vec![fatal]);
        let controller = RetryController::new(test_policy(), &profile);

        let (outcome, records) = controller.run(&generator, &grader, &request()).await;

        assert_eq!(generator.call_count(), 1);
        assert_eq!(records.len(), 1);
        match outcome {
            SessionOutcome::BestEffort { validation, .. } => {
                assert!(validation.auto_fail);
                assert_eq!(validation.total_score, 0);
            }
            other => panic!("expected best-effort outcome, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn enhancements_rebuild_from_base_instead_of_accumulating() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![Ok(image()), Ok(image()), Ok(image())]);
        let grader = ScriptedGrader::new(vec![
            report_at(&profile, 60),
            report_at(&profile, 60),
            report_at(&profile, 60),
        ]);
        let controller = RetryController::new(test_policy(), &profile);

        controller.run(&generator, &grader, &request()).await;

        let prompts = generator.prompts.lock();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0], "base prompt");
        assert!(prompts[1].starts_with("base prompt"));
        assert!(prompts[1].contains("Corrections for this attempt:"));
        // Same failures both rounds: the third prompt equals the second, it
        // does not stack a second corrections block.
        assert_eq!(prompts[1], prompts[2]);
        assert_eq!(prompts[2].matches("Corrections for this attempt:").count(), 1);
    }

    #[tokio::test]
    async fn temperature_decays_to_the_floor() {
        let profile = WorkflowProfile::casual_influencer();
        let generator = ScriptedGenerator::new(vec![Ok(image()), Ok(image()), Ok(image())]);
        let grader = ScriptedGrader::new(vec![
            report_at(&profile, 60),
            report_at(&profile, 60),
            report_at(&profile, 60),
        ]);
        let controller = RetryController::new(test_policy(), &profile);

        controller.run(&generator, &grader, &request()).await;

        let temperatures = generator.temperatures.lock();
        assert_eq!(temperatures.len(), 3);
        assert!((temperatures[0] - 1.0).abs() < 1e-6);
        assert!((temperatures[1] - 0.7).abs() < 1e-6);
        // 1.0 - 2 * 0.3 = 0.4 clamps to the 0.5 floor.
        assert!((temperatures[2] - 0.5).abs() < 1e-6);
    }
}
