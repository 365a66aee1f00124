//! Error types for cache operations

use thiserror::Error;

/// Errors raised by [`crate::ResponseCache`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A single value is larger than the whole cache may hold
    #[error("Entry of {size_bytes} bytes exceeds cache capacity of {max_size_bytes} bytes")]
    EntryTooLarge {
        size_bytes: usize,
        max_size_bytes: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::EntryTooLarge {
            size_bytes: 2048,
            max_size_bytes: 1024,
        };
        assert!(error.to_string().contains("2048 bytes"));
        assert!(error.to_string().contains("1024 bytes"));

        let error = CacheError::ConfigError("max_entries must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: max_entries must be greater than 0"
        );
    }
}
