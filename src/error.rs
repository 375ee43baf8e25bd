//! Error types for the GLOW flow

use thiserror::Error;

/// Result type alias for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by flow layers and the multi-scale network
#[derive(Error, Debug)]
pub enum FlowError {
    /// Tensor shape does not fit the requested operation
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// A half-split was requested on an odd channel count
    #[error("Channel count {0} is odd, cannot split in half")]
    OddChannels(usize),

    /// A built layer received a different channel count
    #[error("Channel mismatch: layer built for {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Latent vector does not match the configured network
    #[error("Latent size mismatch: expected {expected}, got {got}")]
    LatentSize { expected: usize, got: usize },

    /// Layer used before its data-dependent initialization ran
    #[error("{0} used before initialization")]
    Uninitialized(&'static str),

    /// Mixing matrix could not be inverted
    #[error("Mixing matrix is singular")]
    SingularMatrix,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ndarray::ShapeError> for FlowError {
    fn from(err: ndarray::ShapeError) -> Self {
        FlowError::InvalidShape(err.to_string())
    }
}
