use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForageError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Collaborator errors
    #[error("Places service error: {0}")]
    Places(String),

    #[error("Places call timed out after {timeout_secs}s: {operation}")]
    PlacesTimeout { operation: String, timeout_secs: u64 },

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    // Workflow errors
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Stage {stage} timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("Stage {stage} produced no conformant result: {}", .issues.join("; "))]
    Validation { stage: String, issues: Vec<String> },

    #[error("Invalid run input: {0}")]
    InvalidInput(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Cache error: {0}")]
    Cache(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForageError {
    /// Whether the error came from the network rather than from content.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::LlmRequest(_)
                | Self::LlmStream(_)
                | Self::Places(_)
                | Self::PlacesTimeout { .. }
                | Self::Mcp(_)
                | Self::StageTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ForageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_joins_issues() {
        let err = ForageError::Validation {
            stage: "select".into(),
            issues: vec!["meal 'brunch' was not requested".into(), "missing reasoning".into()],
        };
        assert_eq!(
            err.to_string(),
            "Stage select produced no conformant result: meal 'brunch' was not requested; missing reasoning"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(ForageError::LlmRequest("HTTP 503".into()).is_transport());
        assert!(ForageError::StageTimeout { stage: "plan".into(), timeout_secs: 5 }.is_transport());
        assert!(!ForageError::Validation { stage: "plan".into(), issues: vec![] }.is_transport());
        assert!(!ForageError::Config("bad".into()).is_transport());
    }
}
