use thiserror::Error;

/// Everything the triplet kernel can fail with
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    /// Batches, weights or gradient buffers disagree on N or C
    #[error("Shape mismatch: {0}")]
    ShapeError(String),

    #[error("{operation} failed: {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Rejected margin or malformed settings
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Config (de)serialization failed: {0}")]
    SerializationError(String),

    /// Bad weights, unknown layer names, wrong input counts
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backward without a matching forward pass
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O failure: {0}")]
    IoError(String),
}

impl KernelError {
    /// `expected` vs `got`, with an optional hint for the caller
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        match suggestion {
            Some(hint) => KernelError::ShapeError(format!("expected {}, got {} ({})", expected, got, hint)),
            None => KernelError::ShapeError(format!("expected {}, got {}", expected, got)),
        }
    }

    pub fn operation_error(operation: &str, message: &str) -> Self {
        KernelError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::SerializationError(err.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Operation name, input shapes and hints appended to an error message
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub batch_shapes: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Self::default()
        }
    }

    pub fn with_shape(mut self, shape: impl std::fmt::Display) -> Self {
        self.batch_shapes.push(shape.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut lines = vec![format!("in {}", self.operation)];
        if !self.batch_shapes.is_empty() {
            lines.push(format!("batch shapes: {}", self.batch_shapes.join(", ")));
        }
        lines.extend(self.suggestions.iter().map(|s| format!("hint: {}", s)));
        lines.join("\n")
    }
}

/// Lazily attach an [`ErrorContext`] to the error side of a result
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> KernelResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for KernelResult<T> {
    fn with_context<F>(self, f: F) -> KernelResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|err| {
            let suffix = |msg: String| format!("{}\n{}", msg, f().to_error_message());
            match err {
                KernelError::ShapeError(msg) => KernelError::ShapeError(suffix(msg)),
                KernelError::InvalidInput(msg) => KernelError::InvalidInput(suffix(msg)),
                KernelError::OperationError { operation, message } => KernelError::OperationError {
                    operation,
                    message: suffix(message),
                },
                other => other,
            }
        })
    }
}

/// Coarse classification for callers that branch on the failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidOperation,
    ConfigInvalid,
    SerializationFailed,
    InvalidState,
    Io,
}

impl KernelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::ShapeError(_) => ErrorCode::ShapeMismatch,
            KernelError::OperationError { .. } => ErrorCode::InvalidOperation,
            KernelError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            KernelError::SerializationError(_) => ErrorCode::SerializationFailed,
            KernelError::InvalidInput(_) => ErrorCode::InvalidOperation,
            KernelError::InvalidState(_) => ErrorCode::InvalidState,
            KernelError::IoError(_) => ErrorCode::Io,
        }
    }

    /// Only IO failures while loading configuration are worth retrying;
    /// everything raised by the kernel itself is a programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::Io)
    }

    /// Message with a remediation hint, for surfacing to end users
    pub fn user_message(&self) -> String {
        match self {
            KernelError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nAnchor, positive and negative batches must share the same number of samples and feature channels, and the weight vector needs one entry per sample.", msg)
            }
            KernelError::ConfigurationError(msg) => {
                format!("Configuration Error: {}\n\nThe margin must be a finite, non-negative number.", msg)
            }
            KernelError::InvalidState(msg) => {
                format!("Invalid State: {}\n\nRun forward before backward for each evaluation.", msg)
            }
            KernelError::InvalidInput(msg) => {
                format!("Invalid Input: {}\n\nWeights must be finite and non-negative, and layers take exactly three batches.", msg)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_hint() {
        let error = KernelError::shape_error("[4, 8]", "[4, 6]", Some("Did the positive branch use a different embedding size?"));
        assert!(error.to_string().contains("expected [4, 8], got [4, 6]"));
        assert!(error.to_string().contains("different embedding size"));
    }

    #[test]
    fn test_context_is_appended() {
        let result: KernelResult<()> = Err(KernelError::ShapeError("channel mismatch".to_string()));
        let err = result
            .with_context(|| {
                ErrorContext::new("triplet_forward")
                    .with_shape("[32, 128]")
                    .with_shape("[32, 64]")
                    .with_suggestion("Check the embedding dimension of every branch")
            })
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("in triplet_forward"));
        assert!(message.contains("batch shapes: [32, 128], [32, 64]"));
        assert!(message.contains("hint: Check the embedding dimension"));
    }

    #[test]
    fn test_context_leaves_other_errors_alone() {
        let result: KernelResult<()> = Err(KernelError::InvalidState("no forward".to_string()));
        let err = result.with_context(|| ErrorContext::new("backward")).unwrap_err();
        assert_eq!(err, KernelError::InvalidState("no forward".to_string()));
    }

    #[test]
    fn test_codes_and_recoverability() {
        let shape_error = KernelError::ShapeError("test".to_string());
        assert_eq!(shape_error.code(), ErrorCode::ShapeMismatch);
        assert!(!shape_error.is_recoverable());

        let config_error = KernelError::ConfigurationError("negative margin".to_string());
        assert_eq!(config_error.code(), ErrorCode::ConfigInvalid);
        assert!(!config_error.is_recoverable());

        let io_error: KernelError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(io_error.code(), ErrorCode::Io);
        assert!(io_error.is_recoverable());
    }

    #[test]
    fn test_user_message_hint() {
        let error = KernelError::InvalidState("backward called before forward".to_string());
        let message = error.user_message();
        assert!(message.contains("Invalid State"));
        assert!(message.contains("forward before backward"));
    }
}
