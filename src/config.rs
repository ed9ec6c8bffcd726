// src/config.rs
//! Host-supplied configuration
//!
//! The supervising installer hands us its global storage as a TOML file.
//! Top-level keys keep the installer's names:
//!
//! ```toml
//! FINAL_DOWNLOAD_URL = "https://distfiles.gentoo.org/releases/amd64/autobuilds/.../stage3-amd64-openrc-20240101T170000Z.tar.xz"
//! STAGE_NAME_TAR = "stage3-amd64-openrc-20240101T170000Z.tar.xz"
//! GENTOO_LIVECD = "no"
//!
//! [[partitions]]
//! mountPoint = "/"
//! fs = "ext4"
//! luksMapperName = "luks-root"
//! luksUuid = "0b7c..."
//!
//! [pipeline]
//! work_dir = "/mnt"
//! ```
//!
//! [`HostConfig::resolve`] validates the raw keys once and produces a
//! [`PipelineConfig`]; nothing downstream looks at raw keys.

use crate::error::{Error, Result};
use crate::source::SourceLocation;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Raw installer global storage
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    /// Complete archive URL
    #[serde(rename = "FINAL_DOWNLOAD_URL", default)]
    pub final_download_url: Option<String>,

    /// Archive file name
    #[serde(rename = "STAGE_NAME_TAR", default)]
    pub stage_name_tar: Option<String>,

    /// "yes" when running from a live medium with a pre-populated root image
    #[serde(rename = "GENTOO_LIVECD", default)]
    pub gentoo_livecd: Option<String>,

    /// Partition layout chosen by the user
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,

    /// Paths and switches for this tool
    #[serde(default)]
    pub pipeline: PipelineSection,
}

/// One entry of the installer's partition list
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PartitionEntry {
    #[serde(rename = "mountPoint", default)]
    pub mount_point: Option<String>,

    #[serde(default)]
    pub fs: Option<String>,

    #[serde(rename = "luksMapperName", default)]
    pub luks_mapper_name: Option<String>,

    #[serde(rename = "luksUuid", default)]
    pub luks_uuid: Option<String>,
}

impl PartitionEntry {
    pub fn is_root(&self) -> bool {
        self.mount_point.as_deref() == Some("/")
    }

    pub fn is_encrypted(&self) -> bool {
        self.luks_mapper_name.is_some()
    }
}

/// `[pipeline]` section
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    /// Download directory for the archive and its trust artifacts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory the stage3 is extracted into
    #[serde(default = "default_extraction_dir")]
    pub extraction_dir: PathBuf,

    /// Pre-populated root image bound in live mode
    #[serde(default = "default_live_source")]
    pub live_source: PathBuf,

    /// Keyring holding the release signing certificate
    #[serde(default = "default_keyring")]
    pub keyring: PathBuf,

    /// Host resolver configuration copied into the tree
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,

    /// Host binary package host configuration copied into the tree
    #[serde(default = "default_binhost_conf")]
    pub binhost_conf: PathBuf,

    /// Remove the repository snapshot after bootstrap
    #[serde(default)]
    pub prune_repository_metadata: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            extraction_dir: default_extraction_dir(),
            live_source: default_live_source(),
            keyring: default_keyring(),
            resolv_conf: default_resolv_conf(),
            binhost_conf: default_binhost_conf(),
            prune_repository_metadata: false,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/mnt")
}

fn default_extraction_dir() -> PathBuf {
    PathBuf::from("/mnt/gentoo-rootfs")
}

fn default_live_source() -> PathBuf {
    PathBuf::from("/run/rootfsbase")
}

fn default_keyring() -> PathBuf {
    PathBuf::from("/usr/share/openpgp-keys/gentoo-release.asc")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_binhost_conf() -> PathBuf {
    PathBuf::from("/etc/portage/binrepos.conf/gentoobinhost.conf")
}

/// Trim and drop empty strings
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl HostConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigurationError(format!("invalid configuration: {}", e)))
    }

    pub fn is_live(&self) -> bool {
        self.gentoo_livecd.as_deref().map(str::trim) == Some("yes")
    }

    /// Whether the partition mounted at `/` sits on LUKS
    pub fn root_is_encrypted(&self) -> bool {
        self.partitions.iter().any(|p| p.is_root() && p.is_encrypted())
    }

    /// Archive source, validating the URL and name keys
    pub fn source(&self) -> Result<SourceLocation> {
        let url = non_empty(self.final_download_url.as_deref()).ok_or_else(|| {
            Error::ConfigurationError("FINAL_DOWNLOAD_URL is not set".to_string())
        })?;
        let name = non_empty(self.stage_name_tar.as_deref()).ok_or_else(|| {
            Error::ConfigurationError("STAGE_NAME_TAR is not set".to_string())
        })?;
        SourceLocation::new(url, name)
    }

    /// Validate and produce the settings a run uses
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let live = self.is_live();
        let source = if live { None } else { Some(self.source()?) };

        Ok(PipelineConfig {
            live,
            source,
            target: self.pipeline.extraction_dir.clone(),
            work_dir: self.pipeline.work_dir.clone(),
            live_source: self.pipeline.live_source.clone(),
            keyring: self.pipeline.keyring.clone(),
            resolv_conf: self.pipeline.resolv_conf.clone(),
            binhost_conf: self.pipeline.binhost_conf.clone(),
            prune_repository_metadata: self.pipeline.prune_repository_metadata,
            encrypted_root: self.root_is_encrypted(),
        })
    }
}

/// Validated settings for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bind the live root image instead of downloading
    pub live: bool,
    /// Archive location; always present outside live mode
    pub source: Option<SourceLocation>,
    pub target: PathBuf,
    pub work_dir: PathBuf,
    pub live_source: PathBuf,
    pub keyring: PathBuf,
    pub resolv_conf: PathBuf,
    pub binhost_conf: PathBuf,
    pub prune_repository_metadata: bool,
    pub encrypted_root: bool,
}

impl PipelineConfig {
    /// Archive location, required outside live mode
    pub fn source(&self) -> Result<&SourceLocation> {
        self.source.as_ref().ok_or_else(|| {
            Error::ConfigurationError("no archive source configured".to_string())
        })
    }
}
