use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error taxonomy for the triage engine
#[derive(Error, Debug)]
pub enum TriageError {
    /// Session establishment or authentication failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Search, fetch, move or flag command was rejected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Provider throttled the request - deferred to the next pass
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Destination folder does not exist
    #[error("Folder not found: {0}")]
    FolderMissing(String),

    /// Operation exceeded its time bound
    #[error("Operation timed out after {seconds:.1}s: {operation}")]
    Timeout { operation: String, seconds: f64 },

    /// External classification call failed
    #[error("Classification error: {0}")]
    Classification(String),

    /// Message could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Watermark state errors
    #[error("State error: {0}")]
    State(String),

    /// IO error (file operations, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TriageError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TriageError::Connection(_)
                | TriageError::RateLimited(_)
                | TriageError::Timeout { .. }
                | TriageError::Classification(_)
                | TriageError::Io(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Rate-limit class errors get their own retry budget
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TriageError::RateLimited(_))
    }

    /// Errors that mean the mailbox session is gone and the pass cannot continue
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TriageError::Connection(_) | TriageError::Io(_))
    }

    pub(crate) fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        TriageError::Timeout {
            operation: operation.into(),
            seconds: duration.as_secs_f64(),
        }
    }
}

/// Classify a server NO/BAD response text
fn classify_server_response(text: &str) -> TriageError {
    let lower = text.to_lowercase();
    if lower.contains("trycreate")
        || lower.contains("nonexistent")
        || lower.contains("doesn't exist")
        || lower.contains("does not exist")
        || lower.contains("unknown mailbox")
    {
        TriageError::FolderMissing(text.to_string())
    } else if lower.contains("throttled")
        || lower.contains("too many")
        || lower.contains("rate limit")
        || lower.contains("[limit]")
    {
        TriageError::RateLimited(text.to_string())
    } else {
        TriageError::Protocol(text.to_string())
    }
}

impl From<async_imap::error::Error> for TriageError {
    fn from(error: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;

        match error {
            ImapError::Io(err) => TriageError::Connection(format!("IO failure: {}", err)),
            ImapError::ConnectionLost => {
                TriageError::Connection("Connection lost".to_string())
            }
            ImapError::No(ref message) | ImapError::Bad(ref message) => {
                classify_server_response(message)
            }
            ImapError::Parse(err) => TriageError::Protocol(format!("Response parse failure: {}", err)),
            other => TriageError::Protocol(other.to_string()),
        }
    }
}

impl From<async_openai::error::OpenAIError> for TriageError {
    fn from(error: async_openai::error::OpenAIError) -> Self {
        let message = error.to_string();
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
            TriageError::RateLimited(message)
        } else {
            TriageError::Classification(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = TriageError::RateLimited("slow down".to_string());
        assert!(rate_limit.is_transient());
        assert!(rate_limit.is_rate_limited());
        assert!(!rate_limit.is_permanent());

        let timeout = TriageError::timeout("classify", std::time::Duration::from_millis(27_500));
        assert!(timeout.is_transient());
        assert!(!timeout.is_rate_limited());

        let connection = TriageError::Connection("reset by peer".to_string());
        assert!(connection.is_transient());
        assert!(connection.is_connection_lost());
    }

    #[test]
    fn test_permanent_errors() {
        let missing = TriageError::FolderMissing("Receipts".to_string());
        assert!(missing.is_permanent());
        assert!(!missing.is_connection_lost());

        let parse = TriageError::Parse("no body".to_string());
        assert!(parse.is_permanent());

        let config = TriageError::Config("bad value".to_string());
        assert!(config.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = TriageError::timeout("fetch uid 7", std::time::Duration::from_secs(60));
        let display = format!("{}", error);
        assert!(display.contains("timed out after 60.0s"));
        assert!(display.contains("fetch uid 7"));

        let missing = TriageError::FolderMissing("Receipts".to_string());
        assert_eq!(format!("{}", missing), "Folder not found: Receipts");
    }

    #[test]
    fn test_classify_server_response_folder_missing() {
        let err = classify_server_response("[TRYCREATE] No folder Receipts (Failure)");
        assert!(matches!(err, TriageError::FolderMissing(_)));

        let err = classify_server_response("Unknown Mailbox: Foo (now in authenticated state)");
        assert!(matches!(err, TriageError::FolderMissing(_)));
    }

    #[test]
    fn test_classify_server_response_rate_limited() {
        let err = classify_server_response("[THROTTLED] Account exceeded command or bandwidth limits");
        assert!(err.is_rate_limited());

        let err = classify_server_response("Too many simultaneous connections");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_server_response_other() {
        let err = classify_server_response("Invalid arguments");
        assert!(matches!(err, TriageError::Protocol(_)));
    }

    #[test]
    fn test_from_imap_connection_lost() {
        let err: TriageError = async_imap::error::Error::ConnectionLost.into();
        assert!(err.is_connection_lost());
    }

    #[test]
    fn test_from_imap_no_response() {
        let err: TriageError =
            async_imap::error::Error::No("[TRYCREATE] Folder does not exist".to_string()).into();
        assert!(matches!(err, TriageError::FolderMissing(_)));
    }
}
