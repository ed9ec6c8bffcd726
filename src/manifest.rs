// src/manifest.rs

//! Parsers for the checksum file and the DIGESTS manifest
//!
//! A DIGESTS manifest groups digest lines under section headers:
//!
//! ```text
//! # BLAKE2B HASH
//! 3f2a...  stage3-amd64-openrc-20240101T170000Z.tar.xz
//! # SHA512 HASH
//! 9c1d...  stage3-amd64-openrc-20240101T170000Z.tar.xz
//! ```
//!
//! The whole thing is normally wrapped in an OpenPGP cleartext signature.
//! Only lines following a recognized `# <ALGO> HASH` header are attributed to
//! that algorithm. Armor lines, signature blocks and anything that is not a
//! `<hex> <filename>` pair are skipped rather than treated as errors.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s*([A-Za-z0-9_-]+)\s+HASH\s*$").expect("section header pattern is valid")
});

/// Split a `<hex>  <filename>` line, accepting `*filename` binary markers
fn parse_digest_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let digest = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let name = name.trim_start_matches('*');
    let name = name.rsplit('/').next().unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some((digest.to_ascii_lowercase(), name.to_string()))
}

/// Per-file, per-algorithm expected digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestManifest {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl DigestManifest {
    /// Parse manifest text
    pub fn parse(text: &str) -> Self {
        let mut entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut section: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = SECTION_HEADER.captures(line) {
                section = Some(caps[1].to_ascii_uppercase());
                continue;
            }

            // Signature block ends whatever section was open
            if line.starts_with("-----BEGIN PGP SIGNATURE") {
                section = None;
                continue;
            }
            if line.starts_with('#') || line.starts_with("-----") {
                continue;
            }

            let Some(algorithm) = section.as_ref() else {
                continue;
            };
            if let Some((digest, name)) = parse_digest_line(line) {
                entries
                    .entry(name)
                    .or_default()
                    .insert(algorithm.clone(), digest);
            }
        }

        Self { entries }
    }

    /// Expected digests for one file, keyed by upper-case algorithm name
    pub fn entry(&self, file_name: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(file_name)
    }

    /// File names listed in the manifest
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Contents of a `.sha256` checksum file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumFile {
    entries: Vec<(String, String)>,
}

impl ChecksumFile {
    /// Parse `sha256sum`-style text, with or without a `# SHA256 HASH` header
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_digest_line)
            .filter(|(digest, _)| digest.len() == 64)
            .collect();
        Self { entries }
    }

    /// Expected digest for `file_name`
    ///
    /// Falls back to the only entry when the file lists exactly one digest
    /// under a different name.
    pub fn expected_for(&self, file_name: &str) -> Option<&str> {
        if let Some((digest, _)) = self.entries.iter().find(|(_, name)| name == file_name) {
            return Some(digest);
        }
        match self.entries.as_slice() {
            [(digest, _)] => Some(digest),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
