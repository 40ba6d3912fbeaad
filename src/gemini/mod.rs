//! Gemini v1beta wire types and the supported-model table.

pub mod models;
pub mod types;

pub use self::models::{is_supported_model, ModelInfo, SUPPORTED_MODELS};
pub use self::types::{
    Candidate, CandidateContent, Content, FileData, FunctionCall, FunctionResponse,
    GenerateContentResponse, GenerationConfig, InlineData, Part, Request, UsageMetadata,
};
