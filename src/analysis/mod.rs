pub mod adapters;
pub mod schema;

pub use adapters::{Analyzed, AnalysisSource, ReferenceAnalyzer};
pub use schema::{
    Affordance, BackgroundAnalysis, ExpressionAnalysis, Framing, HairOutfitAnalysis, PoseAnalysis,
    Stance,
};
