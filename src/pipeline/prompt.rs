use crate::analysis::schema::{
    BackgroundAnalysis, ExpressionAnalysis, HairOutfitAnalysis, PoseAnalysis, Stance,
};
use crate::compat::CompatibilityResult;
use crate::validation::WorkflowProfile;

fn push_field(lines: &mut Vec<String>, label: &str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        lines.push(format!("{label}: {value}"));
    }
}

/// Assemble the base generation prompt from the structured analyses. The
/// analyst's free-text descriptors are re-injected verbatim; nothing here
/// interprets them.
pub fn build_generation_prompt(
    pose: &PoseAnalysis,
    background: &BackgroundAnalysis,
    expression: &ExpressionAnalysis,
    outfit: &HairOutfitAnalysis,
    compat: &CompatibilityResult,
    extra: Option<&str>,
) -> String {
    let mut lines = vec![
        "Create a photo of the person from the identity reference, placed in the background reference scene.".to_string(),
        String::new(),
        format!(
            "Pose: {} pose, {} framing, camera {} at {}.",
            pose.stance.as_str(),
            pose.framing.as_str(),
            pose.camera_angle.trim(),
            pose.camera_height.trim()
        ),
    ];

    push_field(&mut lines, "Left arm", &pose.left_arm);
    push_field(&mut lines, "Right arm", &pose.right_arm);
    push_field(&mut lines, "Left hand", &pose.left_hand);
    push_field(&mut lines, "Right hand", &pose.right_hand);
    push_field(&mut lines, "Left leg", &pose.left_leg);
    push_field(&mut lines, "Right leg", &pose.right_leg);
    push_field(&mut lines, "Knee angle", &pose.knee_angle);
    push_field(&mut lines, "Knee height", &pose.knee_height);
    push_field(&mut lines, "Foot position", &pose.foot_position);
    push_field(&mut lines, "Torso", &pose.torso_tilt);
    push_field(&mut lines, "Head", &pose.head_tilt);

    lines.push(String::new());
    push_field(&mut lines, "Background", &background.scene_type);
    push_field(&mut lines, "Scene notes", &background.notes);
    if pose.stance == Stance::Sit {
        push_field(&mut lines, "Sit on", &background.sit_on);
    }

    lines.push(String::new());
    push_field(&mut lines, "Expression", &expression.emotion);
    push_field(&mut lines, "Gaze", &expression.gaze);
    push_field(&mut lines, "Mouth", &expression.mouth);
    push_field(&mut lines, "Head angle", &expression.head_angle);

    lines.push(String::new());
    push_field(&mut lines, "Hair", &format!("{} {}", outfit.hair_color.trim(), outfit.hair_style.trim()));
    push_field(&mut lines, "Top", &outfit.top);
    push_field(&mut lines, "Bottom", &outfit.bottom);
    push_field(&mut lines, "Shoes", &outfit.shoes);
    if !outfit.accessories.is_empty() {
        push_field(&mut lines, "Accessories", &outfit.accessories.join(", "));
    }

    if !compat.suggested_adjustments.is_empty() {
        lines.push(String::new());
        lines.push("Scene adjustments:".to_string());
        for adjustment in &compat.suggested_adjustments {
            lines.push(format!("- {adjustment}"));
        }
    }

    if let Some(extra) = extra {
        let extra = extra.trim();
        if !extra.is_empty() {
            lines.push(String::new());
            lines.push(extra.to_string());
        }
    }

    lines.join("\n")
}

/// Append correction directives to the base prompt. Each retry starts from
/// the base again, so directives never pile up across attempts.
pub fn apply_enhancements(base: &str, directives: &[String]) -> String {
    if directives.is_empty() {
        return base.to_string();
    }
    let mut prompt = String::from(base);
    prompt.push_str("\n\nCorrections for this attempt:");
    for directive in directives {
        prompt.push_str("\n- ");
        prompt.push_str(directive);
    }
    prompt
}

/// Task prompt for grading a generated image against the references. The
/// comparison itself is the grader's judgment; we only fix the output shape.
pub fn build_grading_prompt(profile: &WorkflowProfile) -> String {
    let criteria: Vec<&str> = profile.weights.keys().map(|name| name.as_str()).collect();
    let mut prompt = String::from(
        "The final image is a generated photo; the images before it are the references it was generated from.\n\
         Compare the generated photo against the references and score each criterion from 0 to 100:\n",
    );
    for name in &criteria {
        prompt.push_str("- ");
        prompt.push_str(name);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nReturn a JSON object with exactly these keys:\n\
         {\"scores\": {<criterion>: <0-100>}, \"auto_fail\": false, \"auto_fail_reasons\": [], \
         \"reasons\": {<criterion>: \"short justification\"}, \"issues\": []}\n\
         Set auto_fail to true only for disqualifying defects: a different person than the identity \
         reference, anatomical errors such as extra fingers or limbs, or watermarks and text overlays.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::schema::{Affordance, Framing};
    use crate::compat::check_compatibility;

    fn sample_pose() -> PoseAnalysis {
        PoseAnalysis {
            stance: Stance::Sit,
            knee_angle: "약 90도".to_string(),
            framing: Framing::MFS,
            confidence: 0.9,
            ..PoseAnalysis::fallback()
        }
    }

    fn sample_background() -> BackgroundAnalysis {
        BackgroundAnalysis {
            scene_type: "cafe".to_string(),
            provides: vec![Affordance::Seating, Affordance::Surface],
            supported_stances: vec![Stance::Stand, Stance::Sit],
            potential_seating_locations: vec![],
            sit_on: "window bench".to_string(),
            notes: "soft daylight".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn prompt_carries_free_text_fields_verbatim() {
        let pose = sample_pose();
        let background = sample_background();
        let compat = check_compatibility(&pose, &background);
        let prompt = build_generation_prompt(
            &pose,
            &background,
            &ExpressionAnalysis::fallback(),
            &HairOutfitAnalysis::fallback(),
            &compat,
            None,
        );
        assert!(prompt.contains("sit pose"));
        assert!(prompt.contains("약 90도"));
        assert!(prompt.contains("Sit on: window bench"));
        assert!(prompt.contains("Background: cafe"));
        assert!(!prompt.contains("Scene adjustments"));
    }

    #[test]
    fn adjustments_appear_when_compatibility_flags_issues() {
        let mut pose = sample_pose();
        pose.stance = Stance::LeanWall;
        let background = sample_background();
        let compat = check_compatibility(&pose, &background);
        let prompt = build_generation_prompt(
            &pose,
            &background,
            &ExpressionAnalysis::fallback(),
            &HairOutfitAnalysis::fallback(),
            &compat,
            None,
        );
        assert!(prompt.contains("Scene adjustments:"));
    }

    #[test]
    fn enhancements_are_appended_without_replacing_the_base() {
        let base = "base prompt";
        let enhanced = apply_enhancements(
            base,
            &["fix the hands".to_string(), "match the outfit".to_string()],
        );
        assert!(enhanced.starts_with(base));
        assert!(enhanced.contains("- fix the hands"));
        assert!(enhanced.contains("- match the outfit"));
        assert_eq!(apply_enhancements(base, &[]), base);
    }

    #[test]
    fn grading_prompt_lists_every_weighted_criterion() {
        let profile = WorkflowProfile::casual_influencer();
        let prompt = build_grading_prompt(&profile);
        for name in profile.weights.keys() {
            assert!(prompt.contains(name.as_str()), "missing {name}");
        }
        assert!(prompt.contains("auto_fail"));
    }
}
