use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not fetch information: {0}")]
    Extraction(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("task canceled")]
    Cancelled,

    #[error("history database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid task options: {0}")]
    InvalidOptions(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Short cause shown on an Error task.
    pub fn user_message(&self) -> String {
        let raw = match self {
            EngineError::Extraction(msg) | EngineError::Download(msg) => msg.clone(),
            EngineError::ExternalToolMissing { tool } => {
                format!("{tool} was not found. Install it or set its location in engine.json.")
            }
            EngineError::ExternalToolFailed { tool, stderr, .. } if !stderr.is_empty() => {
                format!("{tool}: {stderr}")
            }
            other => other.to_string(),
        };
        let cleaned = clean_tool_message(&raw);
        if cleaned.is_empty() {
            "unknown error".to_string()
        } else {
            cleaned
        }
    }
}

/// Keeps only the text after the last `ERROR:` marker yt-dlp prints.
pub(crate) fn clean_tool_message(raw: &str) -> String {
    let tail = match raw.rfind("ERROR:") {
        Some(idx) => &raw[idx + "ERROR:".len()..],
        None => raw,
    };
    tail.trim().to_string()
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_strips_yt_dlp_error_prefix() {
        let err = EngineError::Extraction(
            "WARNING: something\nERROR: [generic] Unsupported URL: https://example.com".to_string(),
        );
        assert_eq!(
            err.user_message(),
            "[generic] Unsupported URL: https://example.com"
        );
    }

    #[test]
    fn user_message_never_empty() {
        let err = EngineError::Download("   ".to_string());
        assert_eq!(err.user_message(), "unknown error");
    }

    #[test]
    fn missing_tool_message_names_the_tool() {
        let err = EngineError::ExternalToolMissing {
            tool: "yt-dlp".to_string(),
        };
        assert!(err.user_message().starts_with("yt-dlp was not found"));
    }
}
