//! Error types for network quality monitoring

/// Result type alias using QualityError
pub type Result<T> = std::result::Result<T, QualityError>;

/// Errors that can occur while configuring a quality monitor
#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    /// Invalid configuration parameter
    #[error("Invalid quality configuration: {0}")]
    InvalidConfig(String),
}
