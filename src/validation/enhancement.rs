use crate::validation::profile::WorkflowProfile;

/// Correction directives for the next attempt, derived from the criteria
/// that failed this one. Ordered by the profile's rule order, deduplicated,
/// and capped; failure order does not matter.
pub fn enhancement_directives(profile: &WorkflowProfile, failed: &[String]) -> Vec<String> {
    let mut directives: Vec<String> = Vec::new();
    for rule in &profile.enhancements {
        if !failed.iter().any(|name| *name == rule.criterion) {
            continue;
        }
        for directive in &rule.directives {
            if directives.len() == profile.max_directives {
                return directives;
            }
            if !directives.iter().any(|existing| existing == directive) {
                directives.push(directive.clone());
            }
        }
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::profile::EnhancementRule;

    fn profile_with_rules() -> WorkflowProfile {
        let mut profile = WorkflowProfile::casual_influencer();
        profile.enhancements = vec![
            EnhancementRule {
                criterion: "person_identity".to_string(),
                directives: vec!["fix identity".to_string(), "shared directive".to_string()],
            },
            EnhancementRule {
                criterion: "pose_fidelity".to_string(),
                directives: vec!["fix pose".to_string(), "shared directive".to_string()],
            },
            EnhancementRule {
                criterion: "technical_quality".to_string(),
                directives: vec!["fix hands".to_string()],
            },
        ];
        profile.max_directives = 3;
        profile
    }

    #[test]
    fn ordered_by_profile_priority_not_failure_order() {
        let profile = profile_with_rules();
        let failed = vec!["pose_fidelity".to_string(), "person_identity".to_string()];
        let directives = enhancement_directives(&profile, &failed);
        assert_eq!(directives[0], "fix identity");
        assert_eq!(directives[1], "shared directive");
        assert_eq!(directives[2], "fix pose");
    }

    #[test]
    fn duplicates_are_removed_and_length_is_capped() {
        let profile = profile_with_rules();
        let failed = vec![
            "person_identity".to_string(),
            "pose_fidelity".to_string(),
            "technical_quality".to_string(),
        ];
        let directives = enhancement_directives(&profile, &failed);
        assert_eq!(directives.len(), 3);
        assert_eq!(
            directives
                .iter()
                .filter(|directive| directive.as_str() == "shared directive")
                .count(),
            1
        );
    }

    #[test]
    fn no_failures_yield_no_directives() {
        let profile = profile_with_rules();
        assert!(enhancement_directives(&profile, &[]).is_empty());
    }
}
