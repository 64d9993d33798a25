//! Error types shared by the tensor primitives and the estimators

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SbiError {
    /// Malformed call parameters (non-positive counts, bad targets)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Element counts that cannot be reshaped into the requested shape
    #[error("shape error: {0}")]
    Shape(String),

    /// Atom count incompatible with the minibatch size
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// NaN or infinity in an evaluation that must stay finite
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SbiError>;
