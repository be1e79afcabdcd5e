use thiserror::Error;

/// Main error type for the CHONKER matrix core
#[derive(Error, Debug)]
pub enum ChonkerError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("File I/O error: {path}")]
    FileIO {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Layout detector failed: {message}")]
    Detector {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Layout detector timed out after {millis}ms")]
    DetectorTimeout { millis: u64 },

    #[error("Rendering page {page} failed: {message}")]
    Render { page: usize, message: String },

    #[error("Invalid document format: {format}")]
    InvalidFormat { format: String },

    #[error("Malformed JSON payload")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("System resource error: {resource}")]
    SystemResource {
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
}

impl ChonkerError {
    /// Create a detector error with context
    pub fn detector(message: impl Into<String>) -> Self {
        Self::Detector {
            message: message.into(),
            source: None,
        }
    }

    /// Create a detector error with source
    pub fn detector_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Detector {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn render(page: usize, message: impl Into<String>) -> Self {
        Self::Render {
            page,
            message: message.into(),
        }
    }

    /// Create a file I/O error
    pub fn file_io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileIO {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Detector problems degrade fusion to "no regions", so callers treat
    /// them as recoverable. Nothing in the core is process-fatal except
    /// broken configuration and the host running out of resources.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ChonkerError::Detector { .. } => true,
            ChonkerError::DetectorTimeout { .. } => true,
            ChonkerError::Render { .. } => true,
            ChonkerError::InvalidFormat { .. } => true,
            ChonkerError::Serialization { .. } => true,
            ChonkerError::Configuration { .. } => false,
            ChonkerError::SystemResource { .. } => false,
            _ => true,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ChonkerError::Detector { .. } => {
                "🐹 Layout detection unavailable, showing raw text placement.".to_string()
            }
            ChonkerError::DetectorTimeout { millis } => {
                format!(
                    "⏰ Layout detection took longer than {}ms, showing raw text placement.",
                    millis
                )
            }
            ChonkerError::Render { page, .. } => {
                format!("📄 Page {} could not be rendered.", page + 1)
            }
            ChonkerError::FileIO { .. } => {
                "📁 File access error. Check file permissions and disk space.".to_string()
            }
            ChonkerError::Configuration { message } => {
                format!("⚙️  Bad configuration: {}", message)
            }
            ChonkerError::InvalidFormat { format } => {
                format!("📄 Unsupported format: {}.", format)
            }
            _ => "🐹 Something went wrong. Check the logs for details.".to_string(),
        }
    }
}

/// Result type alias for convenience
pub type ChonkerResult<T> = Result<T, ChonkerError>;

/// Error context for adding additional information
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ChonkerResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context(self, context: &str) -> ChonkerResult<T> {
        self.map_err(|e| ChonkerError::SystemResource {
            resource: context.to_string(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_errors_are_recoverable() {
        assert!(ChonkerError::detector("no model").is_recoverable());
        assert!(ChonkerError::DetectorTimeout { millis: 10 }.is_recoverable());
        assert!(!ChonkerError::configuration("capacity is zero").is_recoverable());
    }

    #[test]
    fn test_with_context_wraps_source() {
        let failing: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = failing.with_context("render worker").unwrap_err();
        assert!(matches!(err, ChonkerError::SystemResource { ref resource, .. } if resource == "render worker"));
    }

    #[test]
    fn test_user_message_uses_one_based_pages() {
        let msg = ChonkerError::render(2, "mutool missing").user_message();
        assert!(msg.contains("Page 3"));
    }
}
