//! Crate-wide error type.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by covkit operations.
#[derive(Error, Debug)]
pub enum CovError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("BAM error: {0}")]
    Bam(#[from] rust_htslib::errors::Error),

    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("The specified database only has the following levels available: {0}")]
    Schema(String),
}

pub type Result<T> = std::result::Result<T, CovError>;

impl CovError {
    /// Wrap an I/O error with the path that produced it.
    pub fn path_io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        CovError::PathIo {
            path: path.into(),
            source,
        }
    }
}
