use serde::{Deserialize, Serialize};

/// Body-pose category. Free text from the analyst maps onto one of these;
/// anything unrecognized degrades to `Stand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Stand,
    Sit,
    Walk,
    LeanWall,
    Lean,
    Kneel,
}

impl Stance {
    pub fn parse(raw: &str) -> Stance {
        match raw.trim().to_lowercase().as_str() {
            "stand" | "standing" => Stance::Stand,
            "sit" | "sitting" | "seated" => Stance::Sit,
            "walk" | "walking" => Stance::Walk,
            "lean_wall" | "lean-wall" | "wall_lean" | "leaning_wall" => Stance::LeanWall,
            "lean" | "leaning" => Stance::Lean,
            "kneel" | "kneeling" => Stance::Kneel,
            _ => Stance::Stand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Stand => "stand",
            Stance::Sit => "sit",
            Stance::Walk => "walk",
            Stance::LeanWall => "lean_wall",
            Stance::Lean => "lean",
            Stance::Kneel => "kneel",
        }
    }

    /// Ordering used when ranking alternative stances, simplest first.
    pub fn complexity_rank(&self) -> u8 {
        match self {
            Stance::Stand => 0,
            Stance::LeanWall => 1,
            Stance::Walk => 2,
            Stance::Lean => 3,
            Stance::Sit => 4,
            Stance::Kneel => 5,
        }
    }
}

/// Shot framing, from close-up to full shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    CU,
    MCU,
    MS,
    MFS,
    FS,
}

impl Framing {
    pub fn parse(raw: &str) -> Framing {
        match raw.trim().to_uppercase().as_str() {
            "CU" => Framing::CU,
            "MCU" => Framing::MCU,
            "MS" => Framing::MS,
            "MFS" => Framing::MFS,
            "FS" => Framing::FS,
            _ => Framing::MS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::CU => "CU",
            Framing::MCU => "MCU",
            Framing::MS => "MS",
            Framing::MFS => "MFS",
            Framing::FS => "FS",
        }
    }
}

/// Capability a background offers that makes certain stances physically
/// plausible there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    Wall,
    Seating,
    PotentialSeating,
    Surface,
    Mirror,
    Rail,
    Walkway,
    Door,
}

impl Affordance {
    /// Unknown tags are dropped rather than guessed at.
    pub fn parse(raw: &str) -> Option<Affordance> {
        match raw.trim().to_lowercase().as_str() {
            "wall" => Some(Affordance::Wall),
            "seating" => Some(Affordance::Seating),
            "potential_seating" | "potential-seating" => Some(Affordance::PotentialSeating),
            "surface" => Some(Affordance::Surface),
            "mirror" => Some(Affordance::Mirror),
            "rail" | "railing" => Some(Affordance::Rail),
            "walkway" | "path" | "sidewalk" => Some(Affordance::Walkway),
            "door" | "doorway" => Some(Affordance::Door),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Affordance::Wall => "wall",
            Affordance::Seating => "seating",
            Affordance::PotentialSeating => "potential_seating",
            Affordance::Surface => "surface",
            Affordance::Mirror => "mirror",
            Affordance::Rail => "rail",
            Affordance::Walkway => "walkway",
            Affordance::Door => "door",
        }
    }
}

/// Structured read of a pose reference. Limb and angle fields are the
/// analyst's own wording, sometimes with embedded magnitudes in any language.
/// They are carried verbatim into prompts and never parsed numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseAnalysis {
    pub stance: Stance,
    pub left_arm: String,
    pub right_arm: String,
    pub left_hand: String,
    pub right_hand: String,
    pub left_leg: String,
    pub right_leg: String,
    pub knee_angle: String,
    pub knee_height: String,
    pub foot_position: String,
    pub torso_tilt: String,
    pub head_tilt: String,
    pub framing: Framing,
    pub camera_angle: String,
    pub camera_height: String,
    pub confidence: f32,
}

impl PoseAnalysis {
    pub fn fallback() -> Self {
        PoseAnalysis {
            stance: Stance::Stand,
            left_arm: "relaxed at side".to_string(),
            right_arm: "relaxed at side".to_string(),
            left_hand: "neutral".to_string(),
            right_hand: "neutral".to_string(),
            left_leg: "straight".to_string(),
            right_leg: "straight".to_string(),
            knee_angle: "neutral".to_string(),
            knee_height: "neutral".to_string(),
            foot_position: "shoulder width".to_string(),
            torso_tilt: "upright".to_string(),
            head_tilt: "level".to_string(),
            framing: Framing::MS,
            camera_angle: "eye level".to_string(),
            camera_height: "chest height".to_string(),
            confidence: 0.0,
        }
    }
}

/// Structured read of a background reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundAnalysis {
    pub scene_type: String,
    pub provides: Vec<Affordance>,
    pub supported_stances: Vec<Stance>,
    pub potential_seating_locations: Vec<String>,
    pub sit_on: String,
    pub notes: String,
    pub confidence: f32,
}

impl BackgroundAnalysis {
    pub fn fallback() -> Self {
        BackgroundAnalysis {
            scene_type: "unknown".to_string(),
            provides: Vec::new(),
            supported_stances: vec![Stance::Stand],
            potential_seating_locations: Vec::new(),
            sit_on: String::new(),
            notes: String::new(),
            confidence: 0.0,
        }
    }
}

/// Structured read of facial expression in a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionAnalysis {
    pub gaze: String,
    pub mouth: String,
    pub emotion: String,
    pub head_angle: String,
    pub confidence: f32,
}

impl ExpressionAnalysis {
    pub fn fallback() -> Self {
        ExpressionAnalysis {
            gaze: "toward camera".to_string(),
            mouth: "relaxed".to_string(),
            emotion: "neutral".to_string(),
            head_angle: "straight".to_string(),
            confidence: 0.0,
        }
    }
}

/// Structured read of hair and outfit in a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HairOutfitAnalysis {
    pub hair_style: String,
    pub hair_color: String,
    pub top: String,
    pub bottom: String,
    pub shoes: String,
    pub accessories: Vec<String>,
    pub confidence: f32,
}

impl HairOutfitAnalysis {
    pub fn fallback() -> Self {
        HairOutfitAnalysis {
            hair_style: "as in reference".to_string(),
            hair_color: "as in reference".to_string(),
            top: "as in reference".to_string(),
            bottom: "as in reference".to_string(),
            shoes: "as in reference".to_string(),
            accessories: Vec::new(),
            confidence: 0.0,
        }
    }
}

pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_stance_maps_to_stand() {
        assert_eq!(Stance::parse("crouching tiger"), Stance::Stand);
        assert_eq!(Stance::parse(""), Stance::Stand);
        assert_eq!(Stance::parse(" Sitting "), Stance::Sit);
        assert_eq!(Stance::parse("lean-wall"), Stance::LeanWall);
    }

    #[test]
    fn framing_defaults_to_medium_shot() {
        assert_eq!(Framing::parse("XYZ"), Framing::MS);
        assert_eq!(Framing::parse("cu"), Framing::CU);
        assert_eq!(Framing::parse("mfs"), Framing::MFS);
    }

    #[test]
    fn unknown_affordances_are_dropped() {
        assert_eq!(Affordance::parse("trampoline"), None);
        assert_eq!(Affordance::parse("railing"), Some(Affordance::Rail));
        assert_eq!(
            Affordance::parse("potential_seating"),
            Some(Affordance::PotentialSeating)
        );
    }

    #[test]
    fn fallbacks_carry_zero_confidence() {
        assert_eq!(PoseAnalysis::fallback().confidence, 0.0);
        assert_eq!(BackgroundAnalysis::fallback().confidence, 0.0);
        assert_eq!(ExpressionAnalysis::fallback().confidence, 0.0);
        assert_eq!(HairOutfitAnalysis::fallback().confidence, 0.0);
    }

    #[test]
    fn confidence_is_clamped_to_unit_interval() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f32::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }
}
