use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("Invalid context in {op}: {reason}")]
    InvalidContext { op: &'static str, reason: String },

    #[error("Invalid argument in {op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("Failed allocation in {op}: {reason}")]
    FailedAllocation { op: &'static str, reason: String },

    #[error("Runtime error in {op}: {reason}")]
    Runtime { op: &'static str, reason: String },

    #[error("Internal error in {op}: {reason}")]
    Internal { op: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiffusionError {
    pub fn invalid_context(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidContext { op, reason: reason.into() }
    }

    pub fn invalid_argument(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { op, reason: reason.into() }
    }

    pub fn failed_allocation(op: &'static str, reason: impl Into<String>) -> Self {
        Self::FailedAllocation { op, reason: reason.into() }
    }

    pub fn runtime(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Runtime { op, reason: reason.into() }
    }

    pub fn internal(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Internal { op, reason: reason.into() }
    }

    /// Taxonomy code for this error. I/O and manifest parsing failures are
    /// runtime errors: they come from reading files at setup.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidContext { .. } => ErrorCode::InvalidContext,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::FailedAllocation { .. } => ErrorCode::FailedAllocation,
            Self::Runtime { .. } | Self::Io(_) | Self::Json(_) => ErrorCode::RuntimeError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }
}

/// Status codes reported across the generation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    InvalidContext,
    InvalidArgument,
    FailedAllocation,
    RuntimeError,
    InternalError,
}

impl ErrorCode {
    pub const COUNT: usize = 6;

    pub const ALL: [ErrorCode; Self::COUNT] = [
        ErrorCode::NoError,
        ErrorCode::InvalidContext,
        ErrorCode::InvalidArgument,
        ErrorCode::FailedAllocation,
        ErrorCode::RuntimeError,
        ErrorCode::InternalError,
    ];

    /// Human-readable description of the code.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "No error",
            ErrorCode::InvalidContext => "Invalid context",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::FailedAllocation => "Failed to allocate memory or initialise an object",
            ErrorCode::RuntimeError => "Runtime error occurred",
            ErrorCode::InternalError => "Internal error occurred",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Last recorded message per error code, owned by a generation context.
#[derive(Debug, Clone, Default)]
pub struct ErrorTable {
    entries: [Option<String>; ErrorCode::COUNT],
}

impl ErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` under its code, replacing any earlier message.
    pub fn record(&mut self, err: &DiffusionError) {
        self.entries[err.code().index()] = Some(err.to_string());
    }

    /// Most recent message recorded for `code`, if any.
    pub fn last(&self, code: ErrorCode) -> Option<&str> {
        self.entries[code.index()].as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_taxonomy() {
        assert_eq!(
            DiffusionError::invalid_argument("prepare", "bad").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            DiffusionError::failed_allocation("allocate", "oom").code(),
            ErrorCode::FailedAllocation
        );
        assert_eq!(DiffusionError::runtime("execute", "x").code(), ErrorCode::RuntimeError);
        assert_eq!(DiffusionError::internal("bpe", "x").code(), ErrorCode::InternalError);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(DiffusionError::from(io).code(), ErrorCode::RuntimeError);
    }

    #[test]
    fn test_error_message_carries_operation() {
        let err = DiffusionError::invalid_argument("prepare", "unsupported step count: 7");
        assert_eq!(
            err.to_string(),
            "Invalid argument in prepare: unsupported step count: 7"
        );
    }

    #[test]
    fn test_error_table_records_last_per_code() {
        let mut table = ErrorTable::new();
        assert_eq!(table.last(ErrorCode::RuntimeError), None);

        table.record(&DiffusionError::runtime("execute", "first"));
        table.record(&DiffusionError::runtime("execute", "second"));
        table.record(&DiffusionError::internal("bpe", "missing piece"));

        assert_eq!(table.last(ErrorCode::RuntimeError), Some("Runtime error in execute: second"));
        assert!(table.last(ErrorCode::InternalError).unwrap().contains("missing piece"));
        assert_eq!(table.last(ErrorCode::InvalidArgument), None);
    }

    #[test]
    fn test_error_code_descriptions() {
        for code in ErrorCode::ALL {
            assert!(!code.description().is_empty());
        }
        assert_eq!(ErrorCode::NoError.to_string(), "No error");
    }
}
