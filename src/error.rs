// src/error.rs

//! Error taxonomy for the stage3 pipeline
//!
//! Every fatal condition the pipeline can hit maps onto exactly one variant,
//! and each variant's message names the stage that failed so the host can
//! show it without further decoration.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the stage3 pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// A required configuration value is missing or empty
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A mandatory artifact could not be retrieved
    #[error("transfer failed for {url}: {reason}")]
    TransferError { url: String, reason: String },

    /// Whole-file checksum did not match the checksum file
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// The checksum stage could not run (unreadable or empty checksum file)
    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    /// Detached or inline signature is invalid or not from the pinned key
    #[error("signature verification failed: {0}")]
    ProvenanceError(String),

    /// Digest manifest is unusable or one of its digests does not match
    #[error("digest manifest verification failed: {0}")]
    ManifestError(String),

    /// Archive extraction failed
    #[error("extraction failed: {0}")]
    ExtractionError(String),

    /// Setting up a bind mount failed
    #[error("mount failed: {0}")]
    MountError(String),

    /// A privileged command inside the target tree failed
    #[error("bootstrap command failed: {0}")]
    BootstrapError(String),

    /// The supervising process went away
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Generic I/O failure outside a more specific stage
    #[error("I/O error: {0}")]
    IoError(String),
}

impl Error {
    /// Whether this error is a cancellation rather than a stage failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Short stage label used in diagnostics and progress events
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "configuration",
            Self::TransferError { .. } => "transfer",
            Self::ChecksumMismatch { .. } | Self::IntegrityError(_) => "checksum",
            Self::ProvenanceError(_) => "signature",
            Self::ManifestError(_) => "manifest",
            Self::ExtractionError(_) => "extraction",
            Self::MountError(_) => "mount",
            Self::BootstrapError(_) => "bootstrap",
            Self::Cancelled(_) => "cancelled",
            Self::IoError(_) => "io",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}
