use cellmask_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

use crate::archive::ArchiveError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn invalid_selection(what: &str, value: usize, count: usize) -> Self {
        Self::new(
            ErrorCode::InvalidSelection,
            format!(
                "{what} {value} is outside of range [0, {}]",
                count.saturating_sub(1)
            ),
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for EngineError {}

impl From<ArchiveError> for EngineError {
    fn from(err: ArchiveError) -> Self {
        let code = match err {
            ArchiveError::Io(_) => ErrorCode::Io,
            _ => ErrorCode::InvalidInput,
        };
        EngineError::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::new(ErrorCode::InvalidInput, format!("Invalid JSON: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_selection_names_range() {
        let err = EngineError::invalid_selection("Channel", 3, 3);
        assert!(matches!(err.code, ErrorCode::InvalidSelection));
        assert_eq!(err.message, "Channel 3 is outside of range [0, 2]");
        assert!(err.to_string().starts_with("InvalidSelection"));
    }

    #[test]
    fn test_archive_error_maps_to_codes() {
        let err: EngineError = ArchiveError::LineageCount(2).into();
        assert!(matches!(err.code, ErrorCode::InvalidInput));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = ArchiveError::Io(io).into();
        assert!(matches!(err.code, ErrorCode::Io));
    }
}
