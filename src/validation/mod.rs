pub mod enhancement;
pub mod profile;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analysis::adapters::extract_json_object;
pub use enhancement::enhancement_directives;
pub use profile::{Grade, ProfileRegistry, Tier, WorkflowProfile};

/// Parsed output of the grading oracle call: one 0..100 score per criterion
/// plus any disqualifying observations the grader volunteered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingReport {
    #[serde(default)]
    pub scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub auto_fail: bool,
    #[serde(default)]
    pub auto_fail_reasons: Vec<String>,
    #[serde(default)]
    pub reasons: BTreeMap<String, String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl GradingReport {
    /// Stand-in report when the grader's output could not be used at all.
    /// Scores an auto-fail so the attempt is never accepted on a blind spot.
    pub fn ungradable(reason: &str) -> Self {
        GradingReport {
            auto_fail: true,
            auto_fail_reasons: vec![format!("ungradable output: {reason}")],
            ..GradingReport::default()
        }
    }
}

pub fn parse_grading_report(raw: &str) -> Option<GradingReport> {
    let json = extract_json_object(raw)?;
    let report: GradingReport = serde_json::from_str(&json).ok()?;
    if report.scores.is_empty() && !report.auto_fail {
        return None;
    }
    Some(report)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub score: u32,
    pub threshold: u32,
    pub passed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub workflow: String,
    pub total_score: u32,
    pub grade: Grade,
    pub tier: Tier,
    pub passed: bool,
    pub auto_fail: bool,
    pub auto_fail_reasons: Vec<String>,
    pub criteria: BTreeMap<String, CriterionResult>,
    pub issues: Vec<String>,
    pub too_perfect_applied: bool,
    pub retryable: bool,
}

impl ValidationResult {
    pub fn failed_criteria(&self) -> Vec<String> {
        self.criteria
            .iter()
            .filter(|(_, result)| !result.passed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn text_mentions(texts: &[&String], marker: &str) -> bool {
    let marker = marker.to_lowercase();
    texts
        .iter()
        .any(|text| text.to_lowercase().contains(&marker))
}

/// Turn a grading report into a verdict under the given workflow profile.
/// Pure and total: any report, however hostile, produces a result.
pub fn evaluate(profile: &WorkflowProfile, report: &GradingReport) -> ValidationResult {
    // Only weighted criteria count; anything else the grader emitted is
    // ignored. A weighted criterion the grader skipped scores zero.
    let mut scores: BTreeMap<String, u32> = BTreeMap::new();
    let mut skipped: Vec<String> = Vec::new();
    for name in profile.weights.keys() {
        match report.scores.get(name) {
            Some(score) => {
                scores.insert(name.clone(), (*score).min(100));
            }
            None => {
                scores.insert(name.clone(), 0);
                skipped.push(name.clone());
            }
        }
    }

    let mut auto_fail_reasons: Vec<String> = Vec::new();
    if report.auto_fail {
        if report.auto_fail_reasons.is_empty() {
            auto_fail_reasons.push("grader declared auto-fail".to_string());
        } else {
            auto_fail_reasons.extend(report.auto_fail_reasons.iter().cloned());
        }
    }

    let observed: Vec<&String> = report
        .auto_fail_reasons
        .iter()
        .chain(report.issues.iter())
        .chain(report.reasons.values())
        .collect();
    for trigger in &profile.auto_fail_triggers {
        if text_mentions(&observed, trigger) {
            let reason = format!("grader observed '{trigger}'");
            if !auto_fail_reasons.contains(&reason) {
                auto_fail_reasons.push(reason);
            }
        }
    }

    for (name, floor) in &profile.auto_fail_floors {
        let score = scores.get(name).copied().unwrap_or(0);
        if score < *floor {
            auto_fail_reasons.push(format!(
                "{name} scored {score}, below its auto-fail floor of {floor}"
            ));
        }
    }

    let auto_fail = !auto_fail_reasons.is_empty();

    // Uniformly stellar scores get the designated authenticity criterion
    // knocked down before weighting.
    let mut too_perfect_applied = false;
    if !auto_fail {
        if let Some(rule) = &profile.too_perfect {
            let all_high = scores.values().all(|score| *score >= rule.trigger_floor);
            if all_high {
                if let Some(target) = scores.get_mut(&rule.target_criterion) {
                    *target = target.saturating_sub(rule.penalty);
                    too_perfect_applied = true;
                }
            }
        }
    }

    let weighted_total: f64 = profile
        .weights
        .iter()
        .map(|(name, weight)| {
            let score = scores.get(name).copied().unwrap_or(0);
            f64::from(score) * weight
        })
        .sum();
    let total_score = if auto_fail {
        0
    } else {
        weighted_total.round() as u32
    };

    let grade = if auto_fail {
        Grade::F
    } else {
        profile.grade_for(total_score)
    };
    let tier = profile.tier_for(grade, auto_fail);

    let mut criteria = BTreeMap::new();
    for (name, score) in &scores {
        let threshold = profile.thresholds.get(name).copied().unwrap_or(0);
        let reason = if skipped.contains(name) {
            Some("not scored by grader".to_string())
        } else {
            report.reasons.get(name).cloned()
        };
        criteria.insert(
            name.clone(),
            CriterionResult {
                score: *score,
                threshold,
                passed: *score >= threshold,
                reason,
            },
        );
    }

    let must_pass_cleared = profile.must_pass.iter().all(|name| {
        criteria
            .get(name)
            .map(|result| result.passed)
            .unwrap_or(false)
    });
    let passed = !auto_fail && total_score >= profile.pass_total && must_pass_cleared;

    let retryable = !auto_fail_reasons.iter().any(|reason| {
        profile
            .non_retryable_markers
            .iter()
            .any(|marker| reason.to_lowercase().contains(&marker.to_lowercase()))
    });

    ValidationResult {
        workflow: profile.name.clone(),
        total_score,
        grade,
        tier,
        passed,
        auto_fail,
        auto_fail_reasons,
        criteria,
        issues: report.issues.clone(),
        too_perfect_applied,
        retryable,
    }
}
