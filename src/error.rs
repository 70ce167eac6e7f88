use thiserror::Error;

/// Errors raised by the neighbor index, imputer and renderer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FillError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type FillResult<T> = std::result::Result<T, FillError>;
