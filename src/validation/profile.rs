use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Grade {
    S,
    A,
    B,
    C,
    F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    ReleaseReady,
    NeedsMinorEdit,
    Regenerate,
}

/// Penalty applied when every criterion scores suspiciously high. A feed of
/// casual phone photography should not look like a studio editorial; uniform
/// near-perfect scores are evidence the style drifted, not that the image is
/// good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooPerfectRule {
    pub trigger_floor: u32,
    pub penalty: u32,
    pub target_criterion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBreakpoint {
    pub min_score: u32,
    pub grade: Grade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementRule {
    pub criterion: String,
    pub directives: Vec<String>,
}

/// Everything workflow-specific the validator needs. The engine itself is
/// generic; new workflows are new profiles, not new code paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProfile {
    pub name: String,
    pub weights: BTreeMap<String, f64>,
    pub thresholds: BTreeMap<String, u32>,
    #[serde(default)]
    pub must_pass: Vec<String>,
    #[serde(default)]
    pub auto_fail_floors: BTreeMap<String, u32>,
    #[serde(default)]
    pub auto_fail_triggers: Vec<String>,
    pub pass_total: u32,
    pub grade_breakpoints: Vec<GradeBreakpoint>,
    pub tier_by_grade: BTreeMap<Grade, Tier>,
    #[serde(default)]
    pub too_perfect: Option<TooPerfectRule>,
    #[serde(default)]
    pub enhancements: Vec<EnhancementRule>,
    #[serde(default = "default_max_directives")]
    pub max_directives: usize,
    #[serde(default)]
    pub non_retryable_markers: Vec<String>,
}

fn default_max_directives() -> usize {
    5
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile '{0}': criterion weights sum to {1}, expected 1.0")]
    WeightsSum(String, f64),
    #[error("profile '{0}': '{1}' referenced in {2} is not a weighted criterion")]
    UnknownCriterion(String, String, &'static str),
    #[error("profile '{0}': must-pass criterion '{1}' has no threshold")]
    MissingThreshold(String, String),
    #[error("profile '{0}': grade breakpoints must not be empty")]
    EmptyBreakpoints(String),
    #[error("profile '{0}': max_directives must be at least 1")]
    ZeroDirectiveCap(String),
}

impl WorkflowProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ProfileError::WeightsSum(self.name.clone(), sum));
        }

        for name in self.thresholds.keys() {
            if !self.weights.contains_key(name) {
                return Err(ProfileError::UnknownCriterion(
                    self.name.clone(),
                    name.clone(),
                    "thresholds",
                ));
            }
        }
        for name in &self.must_pass {
            if !self.weights.contains_key(name) {
                return Err(ProfileError::UnknownCriterion(
                    self.name.clone(),
                    name.clone(),
                    "must_pass",
                ));
            }
            if !self.thresholds.contains_key(name) {
                return Err(ProfileError::MissingThreshold(
                    self.name.clone(),
                    name.clone(),
                ));
            }
        }
        for name in self.auto_fail_floors.keys() {
            if !self.weights.contains_key(name) {
                return Err(ProfileError::UnknownCriterion(
                    self.name.clone(),
                    name.clone(),
                    "auto_fail_floors",
                ));
            }
        }
        if let Some(rule) = &self.too_perfect {
            if !self.weights.contains_key(&rule.target_criterion) {
                return Err(ProfileError::UnknownCriterion(
                    self.name.clone(),
                    rule.target_criterion.clone(),
                    "too_perfect",
                ));
            }
        }
        for rule in &self.enhancements {
            if !self.weights.contains_key(&rule.criterion) {
                return Err(ProfileError::UnknownCriterion(
                    self.name.clone(),
                    rule.criterion.clone(),
                    "enhancements",
                ));
            }
        }
        if self.grade_breakpoints.is_empty() {
            return Err(ProfileError::EmptyBreakpoints(self.name.clone()));
        }
        if self.max_directives == 0 {
            return Err(ProfileError::ZeroDirectiveCap(self.name.clone()));
        }
        Ok(())
    }

    pub fn grade_for(&self, total: u32) -> Grade {
        let mut breakpoints = self.grade_breakpoints.clone();
        breakpoints.sort_by(|a, b| b.min_score.cmp(&a.min_score));
        for breakpoint in &breakpoints {
            if total >= breakpoint.min_score {
                return breakpoint.grade;
            }
        }
        Grade::F
    }

    pub fn tier_for(&self, grade: Grade, auto_fail: bool) -> Tier {
        if auto_fail {
            return Tier::Regenerate;
        }
        self.tier_by_grade
            .get(&grade)
            .copied()
            .unwrap_or(Tier::Regenerate)
    }

    /// Built-in default: a casual influencer feed shot on a phone. The
    /// authenticity criterion is the too-perfect target; identity must pass
    /// on its own regardless of the weighted total.
    pub fn casual_influencer() -> Self {
        let weights = BTreeMap::from([
            ("person_identity".to_string(), 0.25),
            ("pose_fidelity".to_string(), 0.15),
            ("outfit_consistency".to_string(), 0.15),
            ("background_fidelity".to_string(), 0.10),
            ("expression_match".to_string(), 0.10),
            ("framing_accuracy".to_string(), 0.05),
            ("casual_authenticity".to_string(), 0.10),
            ("technical_quality".to_string(), 0.10),
        ]);
        let thresholds = BTreeMap::from([
            ("person_identity".to_string(), 70),
            ("pose_fidelity".to_string(), 60),
            ("outfit_consistency".to_string(), 60),
            ("background_fidelity".to_string(), 60),
            ("expression_match".to_string(), 55),
            ("framing_accuracy".to_string(), 50),
            ("casual_authenticity".to_string(), 55),
            ("technical_quality".to_string(), 60),
        ]);

        WorkflowProfile {
            name: "casual_influencer".to_string(),
            weights,
            thresholds,
            must_pass: vec!["person_identity".to_string()],
            auto_fail_floors: BTreeMap::from([("person_identity".to_string(), 50)]),
            auto_fail_triggers: vec![
                "different person".to_string(),
                "extra finger".to_string(),
                "six fingers".to_string(),
                "extra limb".to_string(),
                "watermark".to_string(),
                "text overlay".to_string(),
            ],
            pass_total: 75,
            grade_breakpoints: vec![
                GradeBreakpoint { min_score: 95, grade: Grade::S },
                GradeBreakpoint { min_score: 90, grade: Grade::A },
                GradeBreakpoint { min_score: 85, grade: Grade::B },
                GradeBreakpoint { min_score: 75, grade: Grade::C },
                GradeBreakpoint { min_score: 0, grade: Grade::F },
            ],
            tier_by_grade: BTreeMap::from([
                (Grade::S, Tier::ReleaseReady),
                (Grade::A, Tier::ReleaseReady),
                (Grade::B, Tier::NeedsMinorEdit),
                (Grade::C, Tier::Regenerate),
                (Grade::F, Tier::Regenerate),
            ]),
            too_perfect: Some(TooPerfectRule {
                trigger_floor: 95,
                penalty: 30,
                target_criterion: "casual_authenticity".to_string(),
            }),
            enhancements: vec![
                EnhancementRule {
                    criterion: "person_identity".to_string(),
                    directives: vec![
                        "keep the exact same face as the identity reference, matching eye shape, nose and jawline".to_string(),
                        "do not beautify or restyle the person".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "pose_fidelity".to_string(),
                    directives: vec![
                        "reproduce the reference pose exactly, including arm and leg positions".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "outfit_consistency".to_string(),
                    directives: vec![
                        "keep every garment identical to the outfit reference, including colors and lengths".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "background_fidelity".to_string(),
                    directives: vec![
                        "keep the background scene identical to the background reference".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "expression_match".to_string(),
                    directives: vec![
                        "match the facial expression from the expression reference".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "casual_authenticity".to_string(),
                    directives: vec![
                        "make it look like a casual phone snapshot, not a studio editorial".to_string(),
                        "allow slight imperfection in lighting and composition".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "technical_quality".to_string(),
                    directives: vec![
                        "render hands with exactly five fingers each and natural proportions".to_string(),
                    ],
                },
                EnhancementRule {
                    criterion: "framing_accuracy".to_string(),
                    directives: vec![
                        "use the same shot framing as the pose reference".to_string(),
                    ],
                },
            ],
            max_directives: 5,
            non_retryable_markers: vec!["unusable reference".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    profiles: Vec<WorkflowProfile>,
}

/// Built-in profiles plus whatever the profiles file adds. A file profile
/// with a built-in's name replaces it; invalid profiles are skipped.
#[derive(Debug)]
pub struct ProfileRegistry {
    profiles: Vec<WorkflowProfile>,
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        ProfileRegistry {
            profiles: vec![WorkflowProfile::casual_influencer()],
        }
    }

    pub fn load(path: &Path) -> Self {
        let mut registry = Self::builtin();

        if !path.exists() {
            info!("Workflow profile config not found at {}", path.display());
            return registry;
        }

        let raw = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "Failed to read workflow profiles at {}: {}",
                    path.display(),
                    err
                );
                return registry;
            }
        };

        let parsed: ProfilesFile = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    "Failed to parse workflow profiles at {}: {}",
                    path.display(),
                    err
                );
                return registry;
            }
        };

        let mut loaded = 0usize;
        for profile in parsed.profiles {
            if let Err(err) = profile.validate() {
                warn!("Skipping invalid workflow profile: {err}");
                continue;
            }
            registry.profiles.retain(|existing| existing.name != profile.name);
            registry.profiles.push(profile);
            loaded += 1;
        }
        info!(
            "Loaded {} workflow profile(s) from {}",
            loaded,
            path.display()
        );
        registry
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|profile| profile.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profile_is_internally_consistent() {
        WorkflowProfile::casual_influencer().validate().unwrap();
    }

    #[test]
    fn weights_off_by_more_than_epsilon_are_rejected() {
        let mut profile = WorkflowProfile::casual_influencer();
        profile.weights.insert("person_identity".to_string(), 0.5);
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::WeightsSum(_, _))
        ));
    }

    #[test]
    fn unknown_must_pass_criterion_is_rejected() {
        let mut profile = WorkflowProfile::casual_influencer();
        profile.must_pass.push("sparkle_factor".to_string());
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::UnknownCriterion(_, _, "must_pass"))
        ));
    }

    #[test]
    fn unknown_too_perfect_target_is_rejected() {
        let mut profile = WorkflowProfile::casual_influencer();
        profile.too_perfect = Some(TooPerfectRule {
            trigger_floor: 95,
            penalty: 30,
            target_criterion: "glamour".to_string(),
        });
        assert!(profile.validate().is_err());
    }

    #[test]
    fn grades_follow_breakpoints() {
        let profile = WorkflowProfile::casual_influencer();
        assert_eq!(profile.grade_for(97), Grade::S);
        assert_eq!(profile.grade_for(95), Grade::S);
        assert_eq!(profile.grade_for(91), Grade::A);
        assert_eq!(profile.grade_for(86), Grade::B);
        assert_eq!(profile.grade_for(75), Grade::C);
        assert_eq!(profile.grade_for(74), Grade::F);
        assert_eq!(profile.grade_for(0), Grade::F);
    }

    #[test]
    fn tier_mapping_is_explicit_per_grade() {
        let profile = WorkflowProfile::casual_influencer();
        assert_eq!(profile.tier_for(Grade::S, false), Tier::ReleaseReady);
        assert_eq!(profile.tier_for(Grade::B, false), Tier::NeedsMinorEdit);
        assert_eq!(profile.tier_for(Grade::C, false), Tier::Regenerate);
        assert_eq!(profile.tier_for(Grade::A, true), Tier::Regenerate);
    }

    #[test]
    fn registry_falls_back_to_builtin_when_file_is_missing() {
        let registry = ProfileRegistry::load(Path::new("/nonexistent/profiles.json"));
        assert!(registry.get("casual_influencer").is_some());
    }
}
