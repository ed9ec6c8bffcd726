// src/verify/mod.rs

//! Layered verification of a downloaded stage3 archive
//!
//! Three stages run in increasing order of strength, each with a fixed
//! severity:
//!
//! 1. **Checksum** (mandatory): SHA-256 of the archive against the `.sha256` file
//! 2. **Signature** (fatal if present): detached `.asc` from the pinned key
//! 3. **Manifest** (fatal if present): signed `.DIGESTS`, every listed
//!    algorithm recomputed for the archive
//!
//! The chain exits at the first fatal stage. An absent optional artifact is
//! recorded as [`StageOutcome::SkippedAbsent`] and logged as a warning.

pub mod signature;

pub use signature::{
    GENTOO_RELEASE_FINGERPRINT, PinnedKeyVerifier, ProvenanceCheck, UnavailableKeyring,
    release_verifier,
};

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, HashError, digests_match, hash_file};
use crate::liveness::Liveness;
use crate::manifest::{ChecksumFile, DigestManifest};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of one verification stage
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage ran and the archive passed it
    Passed,
    /// The stage ran and failed; the pipeline must abort
    FailedFatal(Error),
    /// The optional artifact was not available, so the stage did not run
    SkippedAbsent,
}

impl StageOutcome {
    /// Wrap the result of an attempted stage
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(e) => Self::FailedFatal(e),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::SkippedAbsent)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FailedFatal(_))
    }

    /// Convert into a result, treating a skip as success
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Passed | Self::SkippedAbsent => Ok(()),
            Self::FailedFatal(e) => Err(e),
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::FailedFatal(e) => write!(f, "failed: {}", e),
            Self::SkippedAbsent => write!(f, "skipped (artifact absent)"),
        }
    }
}

/// The verification stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    Checksum,
    Signature,
    Manifest,
}

impl VerifyStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checksum => "checksum",
            Self::Signature => "signature",
            Self::Manifest => "manifest",
        }
    }
}

/// Local files belonging to one archive
#[derive(Debug, Clone)]
pub struct TrustArtifactSet {
    /// File name the checksum file and manifest list the archive under
    pub archive_name: String,
    pub archive: PathBuf,
    pub checksum: PathBuf,
    /// Detached signature, if it was retrieved
    pub signature: Option<PathBuf>,
    /// Signed digest manifest, if it was retrieved
    pub manifest: Option<PathBuf>,
}

/// Per-stage outcomes of a chain run
#[derive(Debug)]
pub struct VerificationReport {
    pub checksum: StageOutcome,
    pub signature: StageOutcome,
    pub manifest: StageOutcome,
}

impl VerificationReport {
    /// Conjunction of every stage that ran
    ///
    /// A skipped stage never makes the archive untrusted. The checksum stage
    /// is mandatory and so must have passed.
    pub fn is_trusted(&self) -> bool {
        self.checksum.is_passed() && !self.signature.is_fatal() && !self.manifest.is_fatal()
    }

    /// Stage name and outcome, in execution order
    pub fn stages(&self) -> [(VerifyStage, &StageOutcome); 3] {
        [
            (VerifyStage::Checksum, &self.checksum),
            (VerifyStage::Signature, &self.signature),
            (VerifyStage::Manifest, &self.manifest),
        ]
    }
}

/// Runs the verification stages over one [`TrustArtifactSet`]
pub struct VerificationChain<'a> {
    provenance: &'a dyn ProvenanceCheck,
    liveness: &'a Liveness,
}

impl<'a> VerificationChain<'a> {
    pub fn new(provenance: &'a dyn ProvenanceCheck, liveness: &'a Liveness) -> Self {
        Self {
            provenance,
            liveness,
        }
    }

    /// Run all stages with early exit on the first fatal one
    ///
    /// `on_stage` is called before each stage starts; an error from it
    /// (typically cancellation) stops the chain. The returned error is the
    /// first fatal stage's error.
    pub fn run(
        &self,
        set: &TrustArtifactSet,
        on_stage: &mut dyn FnMut(VerifyStage) -> Result<()>,
    ) -> Result<VerificationReport> {
        on_stage(VerifyStage::Checksum)?;
        let checksum = self.check_checksum(set);
        log_outcome(VerifyStage::Checksum, &checksum);
        if let StageOutcome::FailedFatal(e) = checksum {
            return Err(e);
        }

        on_stage(VerifyStage::Signature)?;
        let signature = self.check_signature(set);
        log_outcome(VerifyStage::Signature, &signature);
        if let StageOutcome::FailedFatal(e) = signature {
            return Err(e);
        }

        on_stage(VerifyStage::Manifest)?;
        let manifest = self.check_manifest(set);
        log_outcome(VerifyStage::Manifest, &manifest);
        if let StageOutcome::FailedFatal(e) = manifest {
            return Err(e);
        }

        Ok(VerificationReport {
            checksum,
            signature,
            manifest,
        })
    }

    /// Whole-file SHA-256 against the checksum file
    pub fn check_checksum(&self, set: &TrustArtifactSet) -> StageOutcome {
        StageOutcome::from_result(self.checksum_inner(set))
    }

    fn checksum_inner(&self, set: &TrustArtifactSet) -> Result<()> {
        let text = fs::read_to_string(&set.checksum).map_err(|e| {
            Error::IntegrityError(format!(
                "cannot read checksum file {}: {}",
                set.checksum.display(),
                e
            ))
        })?;

        let file = ChecksumFile::parse(&text);
        let expected = file.expected_for(&set.archive_name).ok_or_else(|| {
            Error::IntegrityError(format!(
                "checksum file lists no SHA-256 digest for {}",
                set.archive_name
            ))
        })?;

        let digests = hash_file(&set.archive, &[HashAlgorithm::Sha256], self.liveness)
            .map_err(|e| stage_error(e, &set.archive, Error::IntegrityError))?;
        let actual = digests
            .into_iter()
            .next()
            .map(|(_, digest)| digest)
            .unwrap_or_default();

        if !digests_match(expected, &actual) {
            return Err(Error::ChecksumMismatch {
                file: set.archive_name.clone(),
                expected: expected.to_string(),
                actual,
            });
        }

        debug!("SHA-256 of {} matches {}", set.archive_name, actual);
        Ok(())
    }

    /// Detached signature over the archive, if one was retrieved
    pub fn check_signature(&self, set: &TrustArtifactSet) -> StageOutcome {
        let Some(signature) = &set.signature else {
            return StageOutcome::SkippedAbsent;
        };
        if let Err(e) = self.liveness.assert_parent_alive() {
            return StageOutcome::FailedFatal(e);
        }
        StageOutcome::from_result(self.provenance.verify_detached(
            &set.archive,
            signature,
            self.liveness,
        ))
    }

    /// Signed digest manifest, if one was retrieved
    pub fn check_manifest(&self, set: &TrustArtifactSet) -> StageOutcome {
        let Some(manifest) = &set.manifest else {
            return StageOutcome::SkippedAbsent;
        };
        StageOutcome::from_result(self.manifest_inner(set, manifest))
    }

    fn manifest_inner(&self, set: &TrustArtifactSet, manifest: &Path) -> Result<()> {
        self.liveness.assert_parent_alive()?;

        // The manifest is only parsed once its own signature checks out
        let content = self.provenance.verify_signed(manifest)?;
        let text = String::from_utf8_lossy(&content);

        let parsed = DigestManifest::parse(&text);
        if parsed.is_empty() {
            return Err(Error::ManifestError(format!(
                "{} is empty or unparseable",
                manifest.display()
            )));
        }

        let entry = parsed.entry(&set.archive_name).ok_or_else(|| {
            Error::ManifestError(format!("no entry for {}", set.archive_name))
        })?;

        let mut failures = Vec::new();
        let mut expected = Vec::new();
        for (name, digest) in entry {
            match name.parse::<HashAlgorithm>() {
                Ok(algorithm) => expected.push((algorithm, digest.as_str())),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if !expected.is_empty() {
            let algorithms: Vec<HashAlgorithm> = expected.iter().map(|(a, _)| *a).collect();
            let actual = hash_file(&set.archive, &algorithms, self.liveness)
                .map_err(|e| stage_error(e, &set.archive, Error::ManifestError))?;

            for ((algorithm, want), (_, got)) in expected.iter().zip(actual.iter()) {
                if digests_match(want, got) {
                    info!("{} digest of {} verified", algorithm, set.archive_name);
                } else {
                    failures.push(format!(
                        "{} mismatch: expected {}, got {}",
                        algorithm, want, got
                    ));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ManifestError(format!(
                "{}: {}",
                set.archive_name,
                failures.join("; ")
            )))
        }
    }
}

/// Attribute a hashing failure to the stage that was reading the archive
fn stage_error(e: HashError, archive: &Path, stage: fn(String) -> Error) -> Error {
    match e {
        HashError::Cancelled => e.into(),
        other => stage(format!("cannot hash {}: {}", archive.display(), other)),
    }
}

fn log_outcome(stage: VerifyStage, outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Passed => info!("{} verification passed", stage.name()),
        StageOutcome::SkippedAbsent => warn!(
            "{} artifact not available, {} verification skipped",
            stage.name(),
            stage.name()
        ),
        StageOutcome::FailedFatal(e) => warn!("{} verification failed: {}", stage.name(), e),
    }
}
