use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::analysis::schema::{
    clamp_confidence, Affordance, BackgroundAnalysis, ExpressionAnalysis, Framing,
    HairOutfitAnalysis, PoseAnalysis, Stance,
};
use crate::compat::affordances_allow;
use crate::llm::oracle::VisionOracle;

/// Where an analysis value came from. Fallback values carry confidence 0.0
/// and must not drive gating decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisSource {
    Oracle,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Analyzed<T> {
    pub value: T,
    pub source: AnalysisSource,
}

impl<T> Analyzed<T> {
    fn oracle(value: T) -> Self {
        Analyzed {
            value,
            source: AnalysisSource::Oracle,
        }
    }

    fn fallback(value: T) -> Self {
        Analyzed {
            value,
            source: AnalysisSource::Fallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source == AnalysisSource::Fallback
    }
}

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fence regex")
});

/// Pull the JSON object out of whatever the model wrapped it in: markdown
/// fences, leading prose, trailing commentary.
pub fn extract_json_object(raw: &str) -> Option<String> {
    if let Some(captures) = FENCE_RE.captures(raw) {
        return Some(captures[1].to_string());
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

fn parse_object<T: for<'de> Deserialize<'de>>(raw: &str) -> Option<T> {
    let json = extract_json_object(raw)?;
    serde_json::from_str(&json).ok()
}

pub const POSE_TASK_PROMPT: &str = r#"Analyze the person's pose in this reference photo.
Return a JSON object with exactly these keys:
{
  "stance": "stand|sit|walk|lean_wall|lean|kneel",
  "left_arm": "...", "right_arm": "...",
  "left_hand": "...", "right_hand": "...",
  "left_leg": "...", "right_leg": "...",
  "knee_angle": "...", "knee_height": "...", "foot_position": "...",
  "torso_tilt": "...", "head_tilt": "...",
  "framing": "CU|MCU|MS|MFS|FS",
  "camera_angle": "...", "camera_height": "...",
  "confidence": 0.0
}
Describe limbs and angles in short natural language. confidence is your own
certainty in this reading, between 0 and 1."#;

pub const BACKGROUND_TASK_PROMPT: &str = r#"Analyze this background photo as a location for a fashion shoot.
Return a JSON object with exactly these keys:
{
  "scene_type": "...",
  "provides": ["wall", "seating", "potential_seating", "surface", "mirror", "rail", "walkway", "door"],
  "supported_stances": ["stand", "sit", "walk", "lean_wall", "lean", "kneel"],
  "potential_seating_locations": ["..."],
  "sit_on": "...",
  "notes": "...",
  "confidence": 0.0
}
List in provides only elements actually visible. supported_stances are the
poses a person could plausibly hold here. sit_on is the single best seat, or
an empty string."#;

pub const EXPRESSION_TASK_PROMPT: &str = r#"Analyze the person's facial expression in this reference photo.
Return a JSON object with exactly these keys:
{
  "gaze": "...", "mouth": "...", "emotion": "...", "head_angle": "...",
  "confidence": 0.0
}"#;

pub const HAIR_OUTFIT_TASK_PROMPT: &str = r#"Analyze the person's hair and outfit in this reference photo.
Return a JSON object with exactly these keys:
{
  "hair_style": "...", "hair_color": "...",
  "top": "...", "bottom": "...", "shoes": "...",
  "accessories": ["..."],
  "confidence": 0.0
}"#;

#[derive(Debug, Deserialize)]
struct RawPose {
    stance: Option<String>,
    #[serde(default)]
    left_arm: String,
    #[serde(default)]
    right_arm: String,
    #[serde(default)]
    left_hand: String,
    #[serde(default)]
    right_hand: String,
    #[serde(default)]
    left_leg: String,
    #[serde(default)]
    right_leg: String,
    #[serde(default)]
    knee_angle: String,
    #[serde(default)]
    knee_height: String,
    #[serde(default)]
    foot_position: String,
    #[serde(default)]
    torso_tilt: String,
    #[serde(default)]
    head_tilt: String,
    #[serde(default)]
    framing: String,
    #[serde(default)]
    camera_angle: String,
    #[serde(default)]
    camera_height: String,
    #[serde(default)]
    confidence: f32,
}

pub fn parse_pose(raw: &str) -> Option<PoseAnalysis> {
    let parsed: RawPose = parse_object(raw)?;
    let stance = Stance::parse(&parsed.stance?);
    Some(PoseAnalysis {
        stance,
        left_arm: parsed.left_arm,
        right_arm: parsed.right_arm,
        left_hand: parsed.left_hand,
        right_hand: parsed.right_hand,
        left_leg: parsed.left_leg,
        right_leg: parsed.right_leg,
        knee_angle: parsed.knee_angle,
        knee_height: parsed.knee_height,
        foot_position: parsed.foot_position,
        torso_tilt: parsed.torso_tilt,
        head_tilt: parsed.head_tilt,
        framing: Framing::parse(&parsed.framing),
        camera_angle: parsed.camera_angle,
        camera_height: parsed.camera_height,
        confidence: clamp_confidence(parsed.confidence),
    })
}

#[derive(Debug, Deserialize)]
struct RawBackground {
    scene_type: Option<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    supported_stances: Vec<String>,
    #[serde(default)]
    potential_seating_locations: Vec<String>,
    #[serde(default)]
    sit_on: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    confidence: f32,
}

/// Keep only stances the affordances actually back up. The analyst's own
/// list is advisory; stand is always possible.
pub fn validate_supported_stances(
    declared: &[Stance],
    background: &BackgroundAnalysis,
) -> Vec<Stance> {
    let mut validated = vec![Stance::Stand];
    for stance in declared {
        if validated.contains(stance) {
            continue;
        }
        if affordances_allow(*stance, background) {
            validated.push(*stance);
        }
    }
    validated
}

pub fn parse_background(raw: &str) -> Option<BackgroundAnalysis> {
    let parsed: RawBackground = parse_object(raw)?;
    let scene_type = parsed.scene_type?;

    let provides: Vec<Affordance> = {
        let mut seen = Vec::new();
        for tag in &parsed.provides {
            if let Some(affordance) = Affordance::parse(tag) {
                if !seen.contains(&affordance) {
                    seen.push(affordance);
                }
            }
        }
        seen
    };

    let mut background = BackgroundAnalysis {
        scene_type,
        provides,
        supported_stances: Vec::new(),
        potential_seating_locations: parsed.potential_seating_locations,
        sit_on: parsed.sit_on,
        notes: parsed.notes,
        confidence: clamp_confidence(parsed.confidence),
    };

    let declared: Vec<Stance> = parsed
        .supported_stances
        .iter()
        .map(|stance| Stance::parse(stance))
        .collect();
    background.supported_stances = validate_supported_stances(&declared, &background);
    Some(background)
}

#[derive(Debug, Deserialize)]
struct RawExpression {
    #[serde(default)]
    gaze: String,
    #[serde(default)]
    mouth: String,
    emotion: Option<String>,
    #[serde(default)]
    head_angle: String,
    #[serde(default)]
    confidence: f32,
}

pub fn parse_expression(raw: &str) -> Option<ExpressionAnalysis> {
    let parsed: RawExpression = parse_object(raw)?;
    Some(ExpressionAnalysis {
        gaze: parsed.gaze,
        mouth: parsed.mouth,
        emotion: parsed.emotion?,
        head_angle: parsed.head_angle,
        confidence: clamp_confidence(parsed.confidence),
    })
}

#[derive(Debug, Deserialize)]
struct RawHairOutfit {
    #[serde(default)]
    hair_style: String,
    #[serde(default)]
    hair_color: String,
    top: Option<String>,
    #[serde(default)]
    bottom: String,
    #[serde(default)]
    shoes: String,
    #[serde(default)]
    accessories: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

pub fn parse_hair_outfit(raw: &str) -> Option<HairOutfitAnalysis> {
    let parsed: RawHairOutfit = parse_object(raw)?;
    Some(HairOutfitAnalysis {
        hair_style: parsed.hair_style,
        hair_color: parsed.hair_color,
        top: parsed.top?,
        bottom: parsed.bottom,
        shoes: parsed.shoes,
        accessories: parsed.accessories,
        confidence: clamp_confidence(parsed.confidence),
    })
}

/// Wraps the vision oracle for the four reference domains. Every failure
/// path, transport or parse, lands on the documented fallback value.
pub struct ReferenceAnalyzer {
    oracle: Arc<dyn VisionOracle>,
}

impl ReferenceAnalyzer {
    pub fn new(oracle: Arc<dyn VisionOracle>) -> Self {
        ReferenceAnalyzer { oracle }
    }

    async fn analyze_with<T, F>(
        &self,
        image: &[u8],
        task_prompt: &str,
        domain: &str,
        parse: F,
        fallback: T,
    ) -> Analyzed<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        match self.oracle.analyze(&[image.to_vec()], task_prompt).await {
            Ok(raw) => match parse(&raw) {
                Some(value) => Analyzed::oracle(value),
                None => {
                    warn!("{domain} analysis output did not match the schema; using fallback");
                    Analyzed::fallback(fallback)
                }
            },
            Err(err) => {
                warn!("{domain} analysis call failed: {err}; using fallback");
                Analyzed::fallback(fallback)
            }
        }
    }

    pub async fn analyze_pose(&self, image: &[u8]) -> Analyzed<PoseAnalysis> {
        self.analyze_with(image, POSE_TASK_PROMPT, "pose", parse_pose, PoseAnalysis::fallback())
            .await
    }

    pub async fn analyze_background(&self, image: &[u8]) -> Analyzed<BackgroundAnalysis> {
        self.analyze_with(
            image,
            BACKGROUND_TASK_PROMPT,
            "background",
            parse_background,
            BackgroundAnalysis::fallback(),
        )
        .await
    }

    pub async fn analyze_expression(&self, image: &[u8]) -> Analyzed<ExpressionAnalysis> {
        self.analyze_with(
            image,
            EXPRESSION_TASK_PROMPT,
            "expression",
            parse_expression,
            ExpressionAnalysis::fallback(),
        )
        .await
    }

    pub async fn analyze_hair_outfit(&self, image: &[u8]) -> Analyzed<HairOutfitAnalysis> {
        self.analyze_with(
            image,
            HAIR_OUTFIT_TASK_PROMPT,
            "hair/outfit",
            parse_hair_outfit,
            HairOutfitAnalysis::fallback(),
        )
        .await
    }
}
