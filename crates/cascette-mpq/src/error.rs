//! Error types for MPQ operations

use thiserror::Error;

use crate::engine::ErrorCode;

/// Result type for MPQ operations
pub type Result<T> = std::result::Result<T, MpqError>;

/// Errors that can occur while talking to the archive engine
#[derive(Debug, Error)]
pub enum MpqError {
    /// Operation attempted on a handle that was never opened or already closed
    #[error("{operation}: invalid handle")]
    InvalidHandle {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Engine reported a failure that this layer does not interpret
    #[error("{operation} failed (engine error {code})")]
    Engine {
        /// Operation that failed
        operation: &'static str,
        /// Engine error code
        code: ErrorCode,
    },

    /// Flag or compression name outside the known set
    #[error("Unrecognized flag name: {0}")]
    UnknownFlagName(String),

    /// Locale name or code without a table entry
    #[error("Unknown locale: {0}")]
    UnknownLocale(String),

    /// Info class name without a table entry
    #[error("Unknown info class: {0}")]
    UnknownInfoClass(String),

    /// Options that cannot be translated for the engine
    #[error("Invalid option combination: {0}")]
    InvalidOptionCombination(String),

    /// Engine asked for an info buffer that is not larger than the one supplied
    #[error(
        "Info class {class}: engine requires {required} bytes but {requested} bytes were supplied"
    )]
    InsufficientBufferExceeded {
        /// Info class identifier
        class: u32,
        /// Buffer size supplied to the engine
        requested: usize,
        /// Length the engine reported as required
        required: usize,
    },

    /// Archive signature did not verify
    #[error("Archive verification failed with status {status}")]
    ArchiveVerification {
        /// Raw status returned by the engine
        status: u32,
    },

    /// File checks did not pass
    #[error("Verification of {name} failed with status 0x{status:x}")]
    FileVerification {
        /// Archived file name
        name: String,
        /// Raw status bitmask returned by the engine
        status: u32,
    },

    /// Maximum file count outside the hash table limits
    #[error("Max file count {count} must be in range {min} - {max}")]
    MaxFileCountOutOfRange {
        /// Requested count
        count: u32,
        /// Smallest accepted count
        min: u32,
        /// Largest accepted count
        max: u32,
    },

    /// I/O error while staging or reading host files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Options document could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// File content was not valid UTF-8
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl MpqError {
    /// Build an engine error for the given operation
    pub const fn engine(operation: &'static str, code: ErrorCode) -> Self {
        Self::Engine { operation, code }
    }

    /// Engine error code, if this error came from the engine
    pub const fn engine_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error is a use-after-close
    pub const fn is_invalid_handle(&self) -> bool {
        matches!(self, Self::InvalidHandle { .. })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_message_carries_operation_and_code() {
        let err = MpqError::engine("open archive", ErrorCode::FILE_NOT_FOUND);
        let message = err.to_string();
        assert!(message.starts_with("open archive failed"));
        assert!(message.contains(&ErrorCode::FILE_NOT_FOUND.value().to_string()));
        assert_eq!(err.engine_code(), Some(ErrorCode::FILE_NOT_FOUND));
    }

    #[test]
    fn test_invalid_handle() {
        let err = MpqError::InvalidHandle { operation: "search" };
        assert!(err.is_invalid_handle());
        assert_eq!(err.engine_code(), None);
        assert_eq!(err.to_string(), "search: invalid handle");
    }
}
