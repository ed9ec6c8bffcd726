// src/hash.rs

//! Streaming multi-algorithm hashing for archive verification
//!
//! Supported algorithms:
//! - **SHA-256**: whole-file checksum published next to every stage3
//! - **SHA-512**: listed in the signed DIGESTS manifest
//! - **BLAKE2b-512**: listed in the signed DIGESTS manifest
//!
//! Files are read once no matter how many algorithms are requested, and the
//! liveness handle is polled between chunks.

use crate::liveness::Liveness;
use blake2::Blake2b512;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Read buffer for file hashing (1 MB)
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit)
    Sha256,
    /// SHA-512 (512-bit)
    Sha512,
    /// BLAKE2b with 512-bit output
    Blake2b512,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 | Self::Blake2b512 => 64,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake2b512 => "blake2b",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            "blake2b" | "blake2b512" | "blake2b-512" => Ok(Self::Blake2b512),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Hash computation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Unknown hash algorithm name
    UnknownAlgorithm(String),
    /// Reading the input failed
    Io(String),
    /// The liveness check failed between chunks
    Cancelled,
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
            Self::Io(msg) => write!(f, "failed to read input: {}", msg),
            Self::Cancelled => write!(f, "hashing cancelled"),
        }
    }
}

impl std::error::Error for HashError {}

impl From<HashError> for crate::error::Error {
    fn from(e: HashError) -> Self {
        match e {
            HashError::Cancelled => Self::Cancelled("supervising process exited".to_string()),
            other => Self::IoError(other.to_string()),
        }
    }
}

/// Hasher that can compute hashes using any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake2b(Blake2b512),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
            HashAlgorithm::Blake2b512 => HasherState::Blake2b(Blake2b512::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
            HasherState::Blake2b(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
            HasherState::Blake2b(hasher) => hex::encode(hasher.finalize()),
        }
    }

    /// Get the algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute the hex digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Hash a reader with several algorithms in a single pass
pub fn hash_reader<R: Read>(
    reader: &mut R,
    algorithms: &[HashAlgorithm],
    liveness: &Liveness,
) -> Result<Vec<(HashAlgorithm, String)>, HashError> {
    let mut hashers: Vec<Hasher> = algorithms.iter().map(|a| Hasher::new(*a)).collect();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        if !liveness.is_parent_alive() {
            return Err(HashError::Cancelled);
        }
        let n = reader
            .read(&mut buffer)
            .map_err(|e| HashError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        for hasher in &mut hashers {
            hasher.update(&buffer[..n]);
        }
    }

    Ok(hashers
        .into_iter()
        .map(|h| (h.algorithm(), h.finalize()))
        .collect())
}

/// Hash a file with several algorithms in a single pass
pub fn hash_file(
    path: &Path,
    algorithms: &[HashAlgorithm],
    liveness: &Liveness,
) -> Result<Vec<(HashAlgorithm, String)>, HashError> {
    let mut file =
        File::open(path).map_err(|e| HashError::Io(format!("{}: {}", path.display(), e)))?;
    hash_reader(&mut file, algorithms, liveness)
}

/// Compare two hex digests ignoring case and surrounding whitespace
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ParentProbe;
    use std::io::Cursor;
    use std::sync::Arc;

    struct Alive;
    impl ParentProbe for Alive {
        fn parent_pid(&self) -> u32 {
            1000
        }
    }

    struct Orphaned;
    impl ParentProbe for Orphaned {
        fn parent_pid(&self) -> u32 {
            1
        }
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            hash_bytes(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hash_bytes(HashAlgorithm::Sha512, b"abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!(
            hash_bytes(HashAlgorithm::Blake2b512, b"abc"),
            "ba80a53f981c4d0d6a2797b69f12f6e94c212f14685ac4b74b12bb6fdbffa2d1\
             7d87c5392aab792dc252d5de4533cc9518d38aa8dbf1925ab92386edd4009923"
        );
    }

    #[test]
    fn test_single_pass_matches_individual() {
        let data = vec![0x5au8; 3 * 1024 * 1024 + 17];
        let liveness = Liveness::with_probe(Arc::new(Alive));
        let all = [
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha512,
            HashAlgorithm::Blake2b512,
        ];

        let digests = hash_reader(&mut Cursor::new(&data), &all, &liveness).unwrap();
        for (algo, digest) in digests {
            assert_eq!(digest, hash_bytes(algo, &data));
            assert_eq!(digest.len(), algo.hex_len());
        }
    }

    #[test]
    fn test_orphaned_hashing_cancels() {
        let liveness = Liveness::with_probe(Arc::new(Orphaned));
        let result = hash_reader(
            &mut Cursor::new(b"data".to_vec()),
            &[HashAlgorithm::Sha256],
            &liveness,
        );
        assert_eq!(result, Err(HashError::Cancelled));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("SHA512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("BLAKE2B".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Blake2b512);
        assert_eq!("sha-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!(matches!(
            "WHIRLPOOL".parse::<HashAlgorithm>(),
            Err(HashError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_digests_match_ignores_case() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(digests_match(" abc\n", "abc"));
        assert!(!digests_match("abc", "abd"));
    }
}
