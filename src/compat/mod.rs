use serde::{Deserialize, Serialize};

use crate::analysis::schema::{Affordance, BackgroundAnalysis, PoseAnalysis, Stance};

const MISSING_REQUIREMENT_PENALTY: i32 = 50;
const UNSUPPORTED_STANCE_PENALTY: i32 = 30;
const COMPATIBLE_THRESHOLD: i32 = 70;

/// Scene/stance pairs that are never physically sensible, whatever the
/// affordance tags say. Matched by keyword against the scene type. The sit
/// entries are waived when the background offers real or potential seating;
/// kneel is never waived.
const HARD_INCOMPATIBLE: &[(&str, Stance)] = &[
    ("crosswalk", Stance::Sit),
    ("crosswalk", Stance::Kneel),
    ("crossing", Stance::Sit),
    ("crossing", Stance::Kneel),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityLevel {
    Compatible,
    Adjustable,
    Incompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    IllogicalCombination,
    MissingElement,
    UnsupportedStance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub level: CompatibilityLevel,
    pub score: u8,
    pub issues: Vec<CompatibilityIssue>,
    pub alternative_stances: Vec<Stance>,
    pub suggested_adjustments: Vec<String>,
}

/// What a stance needs from the background to be physically plausible.
#[derive(Debug, Clone, Copy)]
pub enum AffordanceRequirement {
    None,
    All(&'static [Affordance]),
    Any(&'static [Affordance]),
}

pub fn stance_requirement(stance: Stance) -> AffordanceRequirement {
    match stance {
        Stance::Sit => AffordanceRequirement::Any(&[Affordance::Seating, Affordance::PotentialSeating]),
        Stance::LeanWall => AffordanceRequirement::All(&[Affordance::Wall]),
        Stance::Lean => AffordanceRequirement::Any(&[Affordance::Rail, Affordance::Surface]),
        Stance::Walk => AffordanceRequirement::All(&[Affordance::Walkway]),
        Stance::Stand | Stance::Kneel => AffordanceRequirement::None,
    }
}

fn provides(background: &BackgroundAnalysis, affordance: Affordance) -> bool {
    background.provides.contains(&affordance)
}

/// True when the background's affordances (or, for sit, a non-empty list of
/// candidate seating spots) satisfy the stance's requirement.
pub fn affordances_allow(stance: Stance, background: &BackgroundAnalysis) -> bool {
    match stance_requirement(stance) {
        AffordanceRequirement::None => true,
        AffordanceRequirement::All(required) => {
            required.iter().all(|affordance| provides(background, *affordance))
        }
        AffordanceRequirement::Any(required) => {
            let tagged = required.iter().any(|affordance| provides(background, *affordance));
            if tagged {
                return true;
            }
            stance == Stance::Sit && !background.potential_seating_locations.is_empty()
        }
    }
}

fn missing_requirement_names(stance: Stance, background: &BackgroundAnalysis) -> Vec<&'static str> {
    match stance_requirement(stance) {
        AffordanceRequirement::None => Vec::new(),
        AffordanceRequirement::All(required) => required
            .iter()
            .filter(|affordance| !provides(background, **affordance))
            .map(|affordance| affordance.as_str())
            .collect(),
        AffordanceRequirement::Any(required) => {
            required.iter().map(|affordance| affordance.as_str()).collect()
        }
    }
}

fn is_hard_incompatible(scene_type: &str, stance: Stance) -> bool {
    let scene = scene_type.trim().to_lowercase();
    HARD_INCOMPATIBLE
        .iter()
        .any(|(keyword, blocked)| *blocked == stance && scene.contains(keyword))
}

fn hard_rule_waived(stance: Stance, background: &BackgroundAnalysis) -> bool {
    stance == Stance::Sit
        && (provides(background, Affordance::Seating)
            || provides(background, Affordance::PotentialSeating))
}

/// Cheapest viable replacement stance, preferring poses the background can
/// actually anchor.
fn repair_stance(stance: Stance, background: &BackgroundAnalysis) -> Stance {
    let wall = provides(background, Affordance::Wall);
    let lean_support =
        provides(background, Affordance::Rail) || provides(background, Affordance::Surface);

    match stance {
        Stance::Sit | Stance::Kneel => {
            if wall {
                Stance::LeanWall
            } else if lean_support {
                Stance::Lean
            } else {
                Stance::Stand
            }
        }
        Stance::LeanWall => {
            if lean_support {
                Stance::Lean
            } else {
                Stance::Stand
            }
        }
        Stance::Lean => {
            if wall {
                Stance::LeanWall
            } else {
                Stance::Stand
            }
        }
        Stance::Walk | Stance::Stand => Stance::Stand,
    }
}

fn stance_swap_suggestion(stance: Stance, background: &BackgroundAnalysis) -> String {
    let replacement = repair_stance(stance, background);
    format!(
        "switch the pose from {} to {}",
        stance.as_str(),
        replacement.as_str()
    )
}

fn alternative_stances(pose: &PoseAnalysis, background: &BackgroundAnalysis) -> Vec<Stance> {
    let mut alternatives: Vec<Stance> = background
        .supported_stances
        .iter()
        .copied()
        .filter(|stance| *stance != pose.stance)
        .collect();
    alternatives.sort_by_key(|stance| stance.complexity_rank());
    alternatives.dedup();
    alternatives
}

fn push_adjustment(adjustments: &mut Vec<String>, suggestion: &str) {
    if !adjustments.iter().any(|existing| existing == suggestion) {
        adjustments.push(suggestion.to_string());
    }
}

fn level_for_score(score: i32) -> CompatibilityLevel {
    if score <= 0 {
        CompatibilityLevel::Incompatible
    } else if score < COMPATIBLE_THRESHOLD {
        CompatibilityLevel::Adjustable
    } else {
        CompatibilityLevel::Compatible
    }
}

/// Decide whether the pose is physically realizable in the background, and
/// if not, what the cheapest fix is. Pure: same inputs, same verdict.
pub fn check_compatibility(
    pose: &PoseAnalysis,
    background: &BackgroundAnalysis,
) -> CompatibilityResult {
    let stance = pose.stance;
    let alternatives = alternative_stances(pose, background);

    if is_hard_incompatible(&background.scene_type, stance) && !hard_rule_waived(stance, background)
    {
        let swap = stance_swap_suggestion(stance, background);
        let reframe = format!(
            "reframe the shot to exclude the {} from view",
            background.scene_type.trim().to_lowercase()
        );
        let issue = CompatibilityIssue {
            kind: IssueKind::IllogicalCombination,
            severity: IssueSeverity::Critical,
            description: format!(
                "a {} pose is never plausible in a {} scene",
                stance.as_str(),
                background.scene_type
            ),
            suggestion: swap.clone(),
        };
        return CompatibilityResult {
            level: CompatibilityLevel::Incompatible,
            score: 0,
            issues: vec![issue],
            alternative_stances: alternatives,
            suggested_adjustments: vec![swap, reframe],
        };
    }

    let mut score: i32 = 100;
    let mut issues = Vec::new();
    let mut adjustments = Vec::new();

    if !affordances_allow(stance, background) {
        score -= MISSING_REQUIREMENT_PENALTY;
        let missing = missing_requirement_names(stance, background);
        let suggestion = stance_swap_suggestion(stance, background);
        issues.push(CompatibilityIssue {
            kind: IssueKind::MissingElement,
            severity: IssueSeverity::Critical,
            description: format!(
                "the {} pose needs {} but the background provides none",
                stance.as_str(),
                missing.join(" or ")
            ),
            suggestion: suggestion.clone(),
        });
        push_adjustment(&mut adjustments, &suggestion);
    }

    if !background.supported_stances.contains(&stance) {
        score -= UNSUPPORTED_STANCE_PENALTY;
        let suggestion = if alternatives.is_empty() {
            stance_swap_suggestion(stance, background)
        } else {
            format!(
                "prefer one of the stances this background supports: {}",
                alternatives
                    .iter()
                    .map(|alternative| alternative.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        issues.push(CompatibilityIssue {
            kind: IssueKind::UnsupportedStance,
            severity: IssueSeverity::Warning,
            description: format!(
                "the background analysis does not list {} among its supported stances",
                stance.as_str()
            ),
            suggestion: suggestion.clone(),
        });
        push_adjustment(&mut adjustments, &suggestion);
    }

    let score = score.max(0);
    CompatibilityResult {
        level: level_for_score(score),
        score: score as u8,
        issues,
        alternative_stances: alternatives,
        suggested_adjustments: adjustments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::schema::{Framing, PoseAnalysis};

    fn pose(stance: Stance) -> PoseAnalysis {
        PoseAnalysis {
            stance,
            confidence: 0.9,
            ..PoseAnalysis::fallback()
        }
    }

    fn background(
        scene_type: &str,
        provides: Vec<Affordance>,
        supported: Vec<Stance>,
    ) -> BackgroundAnalysis {
        BackgroundAnalysis {
            scene_type: scene_type.to_string(),
            provides,
            supported_stances: supported,
            potential_seating_locations: Vec::new(),
            sit_on: String::new(),
            notes: String::new(),
            confidence: 0.9,
        }
    }

    #[test]
    fn repeated_calls_return_identical_results() {
        let p = pose(Stance::Lean);
        let b = background("street", vec![Affordance::Walkway], vec![Stance::Stand, Stance::Walk]);
        let first = check_compatibility(&p, &b);
        let second = check_compatibility(&p, &b);
        assert_eq!(first, second);
    }

    #[test]
    fn adding_missing_affordance_never_lowers_score() {
        let p = pose(Stance::LeanWall);
        let without = background("alley", vec![], vec![Stance::Stand]);
        let mut with = without.clone();
        with.provides.push(Affordance::Wall);

        let before = check_compatibility(&p, &without);
        let after = check_compatibility(&p, &with);
        assert!(after.score >= before.score);
    }

    #[test]
    fn crosswalk_sit_is_incompatible_without_seating() {
        let p = pose(Stance::Sit);
        let b = background("crosswalk", vec![], vec![Stance::Stand, Stance::Walk]);
        let result = check_compatibility(&p, &b);

        assert_eq!(result.level, CompatibilityLevel::Incompatible);
        assert_eq!(result.score, 0);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].kind, IssueKind::IllogicalCombination);
        assert_eq!(result.issues[0].severity, IssueSeverity::Critical);
        assert!(result
            .suggested_adjustments
            .iter()
            .any(|adjustment| adjustment.contains("reframe")));
    }

    #[test]
    fn potential_seating_waives_the_crosswalk_sit_rule() {
        let p = pose(Stance::Sit);
        let b = background(
            "crosswalk",
            vec![Affordance::PotentialSeating],
            vec![Stance::Stand, Stance::Sit],
        );
        let result = check_compatibility(&p, &b);

        assert_ne!(result.level, CompatibilityLevel::Incompatible);
        assert!(result.score >= 70);
    }

    #[test]
    fn crosswalk_kneel_is_never_waived() {
        let p = pose(Stance::Kneel);
        let b = background(
            "crosswalk",
            vec![Affordance::Seating, Affordance::PotentialSeating],
            vec![Stance::Stand],
        );
        let result = check_compatibility(&p, &b);
        assert_eq!(result.level, CompatibilityLevel::Incompatible);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn lean_accepts_rail_or_surface() {
        let p = pose(Stance::Lean);
        let with_rail = background("pier", vec![Affordance::Rail], vec![Stance::Stand, Stance::Lean]);
        let with_surface =
            background("cafe", vec![Affordance::Surface], vec![Stance::Stand, Stance::Lean]);
        let with_neither = background("field", vec![], vec![Stance::Stand, Stance::Lean]);

        assert_eq!(check_compatibility(&p, &with_rail).score, 100);
        assert_eq!(check_compatibility(&p, &with_surface).score, 100);

        let penalized = check_compatibility(&p, &with_neither);
        assert_eq!(penalized.score, 50);
        assert_eq!(penalized.issues[0].kind, IssueKind::MissingElement);
        assert_eq!(penalized.issues[0].severity, IssueSeverity::Critical);
    }

    #[test]
    fn seating_locations_count_as_a_secondary_sit_signal() {
        let p = pose(Stance::Sit);
        let mut b = background("plaza", vec![], vec![Stance::Stand, Stance::Sit]);
        b.potential_seating_locations = vec!["fountain edge".to_string()];
        let result = check_compatibility(&p, &b);
        assert_eq!(result.score, 100);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn cafe_sit_scenario_is_fully_compatible() {
        let p = PoseAnalysis {
            stance: Stance::Sit,
            framing: Framing::MS,
            confidence: 0.9,
            ..PoseAnalysis::fallback()
        };
        let b = background(
            "cafe",
            vec![Affordance::Seating, Affordance::Surface],
            vec![Stance::Stand, Stance::Sit],
        );
        let result = check_compatibility(&p, &b);

        assert_eq!(result.level, CompatibilityLevel::Compatible);
        assert_eq!(result.score, 100);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn street_lean_wall_scenario_flags_the_missing_wall() {
        let p = pose(Stance::LeanWall);
        let b = background(
            "street",
            vec![Affordance::Walkway],
            vec![Stance::Stand, Stance::Walk],
        );
        let result = check_compatibility(&p, &b);

        assert!(result.score <= 50);
        assert!(matches!(
            result.level,
            CompatibilityLevel::Adjustable | CompatibilityLevel::Incompatible
        ));
        let missing: Vec<_> = result
            .issues
            .iter()
            .filter(|issue| issue.kind == IssueKind::MissingElement)
            .collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].description.contains("wall"));
        assert!(result.alternative_stances.contains(&Stance::Stand));
        assert!(result.alternative_stances.contains(&Stance::Walk));
    }

    #[test]
    fn alternatives_are_ranked_simplest_first() {
        let p = pose(Stance::Kneel);
        let b = background(
            "cafe",
            vec![Affordance::Seating, Affordance::Wall],
            vec![Stance::Sit, Stance::Stand, Stance::LeanWall],
        );
        let result = check_compatibility(&p, &b);
        assert_eq!(
            result.alternative_stances,
            vec![Stance::Stand, Stance::LeanWall, Stance::Sit]
        );
    }
}
