// src/source.rs

//! Archive source location and trust-artifact URL derivation
//!
//! The host supplies the complete archive URL plus the archive's file name.
//! The checksum and detached signature live next to the archive under the
//! same name with a suffix; the digest manifest is resolved as a sibling of
//! the archive using the configured archive name.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// The four files one stage3 release is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The compressed root filesystem itself
    Archive,
    /// `.sha256` whole-file checksum
    Checksum,
    /// `.asc` detached OpenPGP signature over the archive
    Signature,
    /// `.DIGESTS` signed multi-algorithm manifest
    Manifest,
}

impl ArtifactKind {
    /// All artifacts in retrieval order
    pub fn all() -> &'static [ArtifactKind] {
        &[Self::Archive, Self::Checksum, Self::Signature, Self::Manifest]
    }

    /// File name suffix appended to the archive name
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Archive => "",
            Self::Checksum => ".sha256",
            Self::Signature => ".asc",
            Self::Manifest => ".DIGESTS",
        }
    }

    /// Whether a failed retrieval aborts the pipeline
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::Archive | Self::Checksum)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Checksum => "checksum file",
            Self::Signature => "detached signature",
            Self::Manifest => "digest manifest",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a stage3 archive and its trust artifacts come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    archive_url: String,
    archive_name: String,
}

impl SourceLocation {
    /// Build a location from the archive URL and archive file name
    ///
    /// Trailing slashes are stripped from the URL. Both values must be
    /// non-empty and the URL must parse.
    pub fn new(archive_url: &str, archive_name: &str) -> Result<Self> {
        let trimmed = archive_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(Error::ConfigurationError(
                "archive URL is empty".to_string(),
            ));
        }
        let archive_name = archive_name.trim();
        if archive_name.is_empty() {
            return Err(Error::ConfigurationError(
                "archive name is empty".to_string(),
            ));
        }
        if archive_name.contains('/') {
            return Err(Error::ConfigurationError(format!(
                "archive name must be a bare file name: {}",
                archive_name
            )));
        }

        Url::parse(trimmed).map_err(|e| {
            Error::ConfigurationError(format!("invalid archive URL '{}': {}", trimmed, e))
        })?;

        Ok(Self {
            archive_url: trimmed.to_string(),
            archive_name: archive_name.to_string(),
        })
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn archive_url(&self) -> &str {
        &self.archive_url
    }

    /// URL the given artifact is retrieved from
    pub fn url_for(&self, kind: ArtifactKind) -> String {
        match kind {
            ArtifactKind::Archive => self.archive_url.clone(),
            ArtifactKind::Checksum | ArtifactKind::Signature => {
                format!("{}{}", self.archive_url, kind.suffix())
            }
            ArtifactKind::Manifest => {
                let dir = match self.archive_url.rfind('/') {
                    Some(idx) => &self.archive_url[..idx],
                    None => self.archive_url.as_str(),
                };
                format!("{}/{}{}", dir, self.archive_name, kind.suffix())
            }
        }
    }

    /// Local download path of the given artifact under `work_dir`
    pub fn local_path(&self, work_dir: &Path, kind: ArtifactKind) -> PathBuf {
        work_dir.join(format!("{}{}", self.archive_name, kind.suffix()))
    }
}
