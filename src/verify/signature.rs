// src/verify/signature.rs

//! OpenPGP signature verification against a pinned release key
//!
//! Uses the sequoia-openpgp library (pure Rust implementation). A signature
//! only counts when it is cryptographically valid AND was made by the
//! certificate whose fingerprint is compiled into this crate. A perfectly
//! good signature from any other key is rejected.

use crate::error::{Error, Result};
use crate::liveness::{Liveness, LivenessReader};
use openpgp::cert::CertParser;
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, GoodChecksum, MessageLayer, MessageStructure, VerificationHelper,
    VerifierBuilder,
};
use openpgp::policy::StandardPolicy;
use openpgp::{Cert, Fingerprint, KeyHandle};
use sequoia_openpgp as openpgp;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Gentoo Linux Release Engineering (Automated Weekly Release Key)
pub const GENTOO_RELEASE_FINGERPRINT: &str = "13EBBDBEDE7A12775DFDB1BABB572E0E2D182910";

/// Establishes that a file was signed by the trusted release key
pub trait ProvenanceCheck: Send + Sync {
    /// Verify a detached signature over `data`
    ///
    /// `data` is streamed; reading stops with [`Error::Cancelled`] once the
    /// supervisor is gone.
    fn verify_detached(&self, data: &Path, signature: &Path, liveness: &Liveness) -> Result<()>;

    /// Verify an inline or cleartext-signed file, returning the signed content
    fn verify_signed(&self, signed: &Path) -> Result<Vec<u8>>;
}

/// Verification helper enforcing the pinned fingerprint
struct PinnedHelper<'a> {
    certs: &'a [Cert],
    pinned: &'a Fingerprint,
}

impl VerificationHelper for PinnedHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        let mut pinned_signature = false;

        for layer in structure.into_iter() {
            match layer {
                MessageLayer::SignatureGroup { results } => {
                    for result in results {
                        match result {
                            Ok(GoodChecksum { ka, .. }) => {
                                let cert_fpr = ka.cert().fingerprint();
                                let key_fpr = ka.key().fingerprint();
                                if cert_fpr == *self.pinned || key_fpr == *self.pinned {
                                    debug!("Good signature from pinned key {}", cert_fpr);
                                    pinned_signature = true;
                                } else {
                                    warn!(
                                        "Valid signature from unexpected key {} (pinned {})",
                                        cert_fpr, self.pinned
                                    );
                                }
                            }
                            Err(e) => debug!("Signature did not verify: {}", e),
                        }
                    }
                }
                MessageLayer::Encryption { .. } => {
                    return Err(anyhow::anyhow!("encrypted content is not a release artifact"));
                }
                _ => {}
            }
        }

        if pinned_signature {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "no valid signature from pinned key {}",
                self.pinned
            ))
        }
    }
}

/// Verifies signatures against one pinned certificate fingerprint
pub struct PinnedKeyVerifier {
    certs: Vec<Cert>,
    pinned: Fingerprint,
    policy: StandardPolicy<'static>,
}

impl PinnedKeyVerifier {
    /// Create a verifier from keyring bytes and a hex fingerprint
    ///
    /// The keyring may hold several certificates; it must hold the pinned one.
    pub fn new(keyring: &[u8], pinned: &str) -> Result<Self> {
        let pinned: Fingerprint = pinned.parse().map_err(|e| {
            Error::ProvenanceError(format!("invalid pinned fingerprint '{}': {}", pinned, e))
        })?;

        let parser = CertParser::from_bytes(keyring)
            .map_err(|e| Error::ProvenanceError(format!("Failed to parse keyring: {}", e)))?;

        let mut certs = Vec::new();
        for cert in parser {
            match cert {
                Ok(cert) => certs.push(cert),
                Err(e) => warn!("Skipping unparseable certificate in keyring: {}", e),
            }
        }

        let has_pinned = certs.iter().any(|cert| {
            cert.fingerprint() == pinned || cert.keys().any(|ka| ka.key().fingerprint() == pinned)
        });
        if !has_pinned {
            return Err(Error::ProvenanceError(format!(
                "keyring does not contain the pinned release key {}",
                pinned
            )));
        }

        debug!("Loaded {} certificate(s), pinned {}", certs.len(), pinned);
        Ok(Self {
            certs,
            pinned,
            policy: StandardPolicy::new(),
        })
    }

    /// Load the keyring from a file
    pub fn from_keyring_file(path: &Path, pinned: &str) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            Error::ProvenanceError(format!(
                "Failed to read release keyring {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::new(&data, pinned)
    }

    /// Verifier pinned to the Gentoo release engineering key
    pub fn gentoo_release(keyring: &Path) -> Result<Self> {
        Self::from_keyring_file(keyring, GENTOO_RELEASE_FINGERPRINT)
    }

    pub fn pinned(&self) -> &Fingerprint {
        &self.pinned
    }

    fn helper(&self) -> PinnedHelper<'_> {
        PinnedHelper {
            certs: &self.certs,
            pinned: &self.pinned,
        }
    }
}

impl ProvenanceCheck for PinnedKeyVerifier {
    fn verify_detached(&self, data: &Path, signature: &Path, liveness: &Liveness) -> Result<()> {
        debug!("Verifying detached signature {:?} over {:?}", signature, data);

        let signature_data = fs::read(signature)
            .map_err(|e| Error::ProvenanceError(format!("Failed to read signature file: {}", e)))?;

        let mut verifier = DetachedVerifierBuilder::from_bytes(&signature_data)
            .map_err(|e| Error::ProvenanceError(format!("Failed to parse signature: {}", e)))?
            .with_policy(&self.policy, None, self.helper())
            .map_err(|e| Error::ProvenanceError(format!("{}", e)))?;

        let file = fs::File::open(data)
            .map_err(|e| Error::ProvenanceError(format!("{}: {}", data.display(), e)))?;
        if let Err(e) = verifier.verify_reader(LivenessReader::new(file, liveness)) {
            liveness.assert_parent_alive()?;
            return Err(Error::ProvenanceError(format!("{}: {}", data.display(), e)));
        }

        info!("Successfully verified signature for {:?}", data);
        Ok(())
    }

    fn verify_signed(&self, signed: &Path) -> Result<Vec<u8>> {
        debug!("Verifying signed file {:?}", signed);

        let signed_data = fs::read(signed)
            .map_err(|e| Error::ProvenanceError(format!("Failed to read signed file: {}", e)))?;

        let mut verifier = VerifierBuilder::from_bytes(&signed_data)
            .map_err(|e| Error::ProvenanceError(format!("Failed to parse signed file: {}", e)))?
            .with_policy(&self.policy, None, self.helper())
            .map_err(|e| Error::ProvenanceError(format!("{}: {}", signed.display(), e)))?;

        let mut content = Vec::new();
        verifier
            .read_to_end(&mut content)
            .map_err(|e| Error::ProvenanceError(format!("{}: {}", signed.display(), e)))?;

        if !verifier.message_processed() {
            return Err(Error::ProvenanceError(format!(
                "{}: signed message was not fully processed",
                signed.display()
            )));
        }

        info!("Successfully verified signed file {:?}", signed);
        Ok(content)
    }
}

/// Stands in for the verifier when the release keyring cannot be loaded
///
/// Runs without signed artifacts still work; any signature that is present
/// is rejected.
#[derive(Debug, Clone)]
pub struct UnavailableKeyring {
    reason: String,
}

impl UnavailableKeyring {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> Error {
        Error::ProvenanceError(format!("release keyring unavailable: {}", self.reason))
    }
}

impl ProvenanceCheck for UnavailableKeyring {
    fn verify_detached(&self, _data: &Path, _signature: &Path, _liveness: &Liveness) -> Result<()> {
        Err(self.error())
    }

    fn verify_signed(&self, _signed: &Path) -> Result<Vec<u8>> {
        Err(self.error())
    }
}

/// Verifier for the Gentoo release key, loaded from `keyring`
pub fn release_verifier(keyring: &Path) -> Arc<dyn ProvenanceCheck> {
    match PinnedKeyVerifier::gentoo_release(keyring) {
        Ok(verifier) => Arc::new(verifier),
        Err(e) => {
            warn!("{}; signed artifacts will be rejected", e);
            Arc::new(UnavailableKeyring::new(e.to_string()))
        }
    }
}
