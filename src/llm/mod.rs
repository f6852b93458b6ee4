pub mod gemini;
pub mod keypool;
pub mod media;
pub mod oracle;

pub use gemini::GeminiOracle;
pub use keypool::KeyPool;
pub use oracle::{
    GeneratedImage, GenerationRequest, ImageOracle, OracleError, VisionOracle,
};
