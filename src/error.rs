use thiserror::Error;

/// Pipeline-wide error type. Every failure a worker can hit is classified
/// here so the invoice row ends up with a stable `error_code` the retry
/// worker can act on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("AI provider overloaded: {0}")]
    Overloaded(String),

    #[error("AI provider rate limited: {0}")]
    RateLimited(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures (DNS, reset, timeout) are transient.
        PipelineError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(format!("invalid JSON: {err}"))
    }
}

impl PipelineError {
    /// Stable code persisted on the invoice row; the retry worker keys off it.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Overloaded(_) => "overloaded",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::BadInput(_) => "bad_input",
            PipelineError::Validation(_) => "validation",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Db(_) => "db",
            PipelineError::Http(_) => "http",
            PipelineError::Other(_) => "other",
        }
    }

    /// Whether the retry worker may re-submit the invoice automatically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Overloaded(_) | PipelineError::RateLimited(_) | PipelineError::Http(_)
        )
    }

    /// Codes the retry worker treats as transient when scanning failed rows.
    pub const TRANSIENT_CODES: [&'static str; 3] = ["overloaded", "rate_limited", "http"];

    /// Guidance text shown to the person who uploaded the invoice.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Overloaded(_) | PipelineError::Http(_) => {
                "The extraction service is temporarily unavailable. The invoice will be retried automatically.".to_string()
            }
            PipelineError::RateLimited(_) => {
                "The extraction service quota was exceeded. The invoice will be retried after a cool-down.".to_string()
            }
            PipelineError::BadInput(msg) => {
                format!("The uploaded file could not be processed ({msg}). Please re-submit a corrected file.")
            }
            PipelineError::Validation(msg) => {
                format!("The extracted data failed validation ({msg}). Please review and re-submit.")
            }
            PipelineError::Configuration(_) => {
                "The extraction service is misconfigured. An operator has to fix the credentials.".to_string()
            }
            PipelineError::Db(err) => format!("Internal storage error: {err}"),
            PipelineError::Other(msg) => {
                format!("Processing failed: {msg}. Delete the invoice and upload it again.")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transient_classification() {
        assert!(PipelineError::Overloaded("503".into()).is_transient());
        assert!(PipelineError::RateLimited("429".into()).is_transient());
        assert!(PipelineError::Http("connection reset".into()).is_transient());
        assert!(!PipelineError::BadInput("empty file".into()).is_transient());
        assert!(!PipelineError::Validation("no lines".into()).is_transient());
        assert!(!PipelineError::Configuration("bad key".into()).is_transient());
    }

    #[test]
    fn codes_match_transient_list() {
        for code in PipelineError::TRANSIENT_CODES {
            let err = match code {
                "overloaded" => PipelineError::Overloaded(String::new()),
                "rate_limited" => PipelineError::RateLimited(String::new()),
                "http" => PipelineError::Http(String::new()),
                _ => unreachable!(),
            };
            assert_eq!(err.code(), code);
            assert!(err.is_transient());
        }
    }

    #[test]
    fn configuration_message_targets_operators() {
        let msg = PipelineError::Configuration("invalid key".into()).user_message();
        assert!(msg.contains("operator"));
    }
}
