//! Supported-model whitelist used for request validation and listing.

/// Metadata for one supported model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

/// The canonical list of model identifiers the gateway accepts.
pub const SUPPORTED_MODELS: &[ModelInfo] = &[
    ModelInfo {
        name: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        description: "Fast multimodal generation",
    },
    ModelInfo {
        name: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        description: "Accurate multimodal generation",
    },
    ModelInfo {
        name: "gemini-2.5-pro-preview-06-05",
        display_name: "Gemini 2.5 Pro Preview (06-05)",
        description: "Accurate multimodal generation",
    },
    ModelInfo {
        name: "gemini-2.5-pro-preview-05-06",
        display_name: "Gemini 2.5 Pro Preview (05-06)",
        description: "Accurate multimodal generation",
    },
    ModelInfo {
        name: "gemini-3-pro-preview-11-2025",
        display_name: "Gemini 3.0 Pro Preview (11-2025)",
        description: "Preview multimodal generation",
    },
];

/// Whether `name` is one of the whitelisted model identifiers.
pub fn is_supported_model(name: &str) -> bool {
    SUPPORTED_MODELS.iter().any(|m| m.name == name)
}
