//! Error type shared by every layer of the service

use thiserror::Error;

/// Fixed message returned for uploads whose extension is not accepted
pub const INVALID_FILE_TYPE: &str =
    "Invalid file type. Only .jpg, .jpeg, .png, .dcm, .nii, .nii.gz files are supported.";

#[derive(Error, Debug)]
pub enum Error {
    /// Bad file type, oversized upload, or malformed request payload
    #[error("{0}")]
    Validation(String),

    /// The uploaded bytes could not be decoded as an image
    #[error("could not decode image: {0}")]
    Format(String),

    /// No scan with the given id
    #[error("{0}")]
    NotFound(String),

    /// Accepted by validation but there is no model for it
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The classifier's forward pass failed
    #[error("inference failed: {0}")]
    Inference(String),

    /// Heatmap computation failed. The analyzer never surfaces this one
    #[error("explanation failed: {0}")]
    Explanation(String),

    /// Model, layer, or settings problem found at startup
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
