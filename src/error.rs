//! Error taxonomy shared by mounting, resolution and the read pipeline.

use std::fmt;

/// Errors surfaced by the container engine.
///
/// Every variant carries owned text so that one failed compression block can
/// be reported to each logical request that depended on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStoreError {
    /// The data or TOC file of a container could not be opened.
    FileOpenFailed(String),
    /// The TOC is malformed or describes ranges outside the container files.
    CorruptToc(String),
    /// The chunk is not present in any mounted container.
    NotFound,
    /// Malformed read options or engine configuration.
    InvalidParameter(String),
    /// A physical read against the data file failed.
    ReadError(String),
    /// A compression block could not be decoded.
    DecompressionFailed(String),
}

impl IoStoreError {
    /// Short, stable name of the error kind.
    pub fn name(&self) -> &'static str {
        match self {
            IoStoreError::FileOpenFailed(_) => "FileOpenFailed",
            IoStoreError::CorruptToc(_) => "CorruptToc",
            IoStoreError::NotFound => "NotFound",
            IoStoreError::InvalidParameter(_) => "InvalidParameter",
            IoStoreError::ReadError(_) => "ReadError",
            IoStoreError::DecompressionFailed(_) => "DecompressionFailed",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IoStoreError::NotFound)
    }
}

impl fmt::Display for IoStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStoreError::NotFound => f.write_str(self.name()),
            IoStoreError::FileOpenFailed(msg)
            | IoStoreError::CorruptToc(msg)
            | IoStoreError::InvalidParameter(msg)
            | IoStoreError::ReadError(msg)
            | IoStoreError::DecompressionFailed(msg) => write!(f, "{}: {}", self.name(), msg),
        }
    }
}

impl std::error::Error for IoStoreError {}

pub type Result<T> = std::result::Result<T, IoStoreError>;
