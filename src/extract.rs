// src/extract.rs

//! Stage3 archive extraction into the target tree
//!
//! Extraction makes two passes over the compressed stream: the first counts
//! members so progress can be reported as a fraction, the second unpacks them
//! one by one. Every member goes through `unpack_in`, so entries that would
//! land outside the target are refused.
//!
//! A member whose path already exists is tolerated (logged and skipped);
//! any other I/O failure aborts the extraction.

use crate::compression::open_archive;
use crate::error::{Error, Result};
use crate::liveness::Liveness;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tar::Archive;
use tracing::{debug, info, warn};

/// Per-member progress callback: (members done, members total)
pub type MemberProgress<'a> = dyn FnMut(u64, u64) -> Result<()> + 'a;

/// Totals from one extraction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Members in the archive
    pub members: u64,
    /// Members skipped because their path already existed
    pub collisions: u64,
}

/// Make `target` an existing, empty directory
///
/// Files, symlinks and subdirectories left by an earlier run are removed;
/// the directory itself is kept so a mount point stays valid.
pub fn prepare_target(target: &Path) -> Result<()> {
    if !target.exists() {
        fs::create_dir_all(target).map_err(|e| {
            Error::ExtractionError(format!("cannot create {}: {}", target.display(), e))
        })?;
        return Ok(());
    }

    let entries = fs::read_dir(target).map_err(|e| {
        Error::ExtractionError(format!("cannot read {}: {}", target.display(), e))
    })?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let removed = if file_type.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| {
            Error::ExtractionError(format!("cannot clear {}: {}", path.display(), e))
        })?;
    }

    debug!("Cleared extraction target {}", target.display());
    Ok(())
}

/// Count the members of an archive without extracting
pub fn count_members(archive_path: &Path, liveness: &Liveness) -> Result<u64> {
    let mut archive = Archive::new(open_archive(archive_path)?);
    let mut count = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| Error::ExtractionError(format!("cannot read archive: {}", e)))?;
    for entry in entries {
        entry.map_err(|e| Error::ExtractionError(format!("corrupt archive member: {}", e)))?;
        count += 1;
        if count % 1024 == 0 {
            liveness.assert_parent_alive()?;
        }
    }

    Ok(count)
}

/// Extract `archive_path` into `target`
///
/// The liveness handle and `on_progress` are consulted after every member.
pub fn extract(
    archive_path: &Path,
    target: &Path,
    liveness: &Liveness,
    on_progress: &mut MemberProgress<'_>,
) -> Result<ExtractionSummary> {
    info!(
        "Extracting {} into {}",
        archive_path.display(),
        target.display()
    );

    let total = count_members(archive_path, liveness)?;
    debug!("{} members to extract", total);

    let mut archive = Archive::new(open_archive(archive_path)?);
    archive.set_preserve_permissions(true);
    // Ownership can only be restored when running as root
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut summary = ExtractionSummary {
        members: total,
        collisions: 0,
    };
    let mut done = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| Error::ExtractionError(format!("cannot read archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::ExtractionError(format!("corrupt archive member: {}", e)))?;
        let member = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<invalid path>".to_string());

        match entry.unpack_in(target) {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::ExtractionError(format!(
                    "member {} escapes {}",
                    member,
                    target.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!("Skipping {}: path already exists", member);
                summary.collisions += 1;
            }
            Err(e) => {
                return Err(Error::ExtractionError(format!(
                    "failed to extract {}: {}",
                    member, e
                )));
            }
        }

        done += 1;
        liveness.assert_parent_alive()?;
        on_progress(done, total)?;
    }

    info!(
        "Extracted {} members ({} collisions)",
        summary.members, summary.collisions
    );
    Ok(summary)
}
