use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_TRANSPORT: &str = "ERR_TRANSPORT";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_OFFLINE: &str = "ERR_OFFLINE";
pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// The executor never produced a result, even after the session's retries.
    pub fn transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn offline(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_OFFLINE, message, trace_id)
    }

    pub fn not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message, trace_id)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.code.as_str(), ERR_TRANSPORT | ERR_TIMEOUT | ERR_NOT_FOUND)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(AppError::not_found("no focus", "t").is_retryable());
        assert!(AppError::transport("no output", "t").is_retryable());
        assert!(AppError::timeout("slow", "t").is_retryable());
        assert!(!AppError::offline("gone", "t").is_retryable());
        assert!(!AppError::validation("bad", "t").is_retryable());
    }

    #[test]
    fn display_includes_code() {
        let err = AppError::offline("device ABC is offline", "trace");
        assert_eq!(err.to_string(), "device ABC is offline (ERR_OFFLINE)");
    }
}
