//! Render errors
//!
//! Configuration errors are fatal and reach the caller. Everything else is
//! recovered where it happens and degrades only its own fragment.

use thiserror::Error;

use crate::expr::ExprError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Missing required render parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Unknown insertion mode: {0}")]
    UnknownMode(String),

    #[error("Unsupported text mode: {0}")]
    UnsupportedTextMode(String),

    #[error("Directive {name} has rank {rank} outside [{min}, {max}]")]
    RankOutOfBounds {
        name: String,
        rank: u32,
        min: u32,
        max: u32,
    },

    #[error("Unsupported template source: {0}")]
    UnsupportedTemplateSource(String),

    #[error("Context {0} is already rendered")]
    AlreadyRendered(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("No scope named {0} in the resolver chain")]
    UnknownScope(String),

    #[error("Invalid data path: `{0}`")]
    InvalidPath(String),

    #[error("Unknown data mode: {0}")]
    UnknownDataMode(String),

    #[error("Invalid loop: {0}")]
    InvalidLoop(String),

    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RenderError {
    /// Configuration errors abort the render instead of being logged and skipped.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RenderError::MissingParameter(_)
                | RenderError::UnknownMode(_)
                | RenderError::UnsupportedTextMode(_)
                | RenderError::RankOutOfBounds { .. }
                | RenderError::UnsupportedTemplateSource(_)
                | RenderError::AlreadyRendered(_)
                | RenderError::UnsupportedOperation(_)
        )
    }

    pub(crate) fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        RenderError::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_split() {
        assert!(RenderError::UnknownMode("sideways".into()).is_configuration());
        assert!(RenderError::UnsupportedOperation("delete").is_configuration());
        assert!(!RenderError::UnknownScope("page".into()).is_configuration());
        assert!(!RenderError::fetch("http://x", "refused").is_configuration());
    }
}
