// src/compression/mod.rs
//! Decoder selection for stage3 archive streams
//!
//! Release archives are normally `.tar.xz`, but mirrors and local builds also
//! produce gzip and zstd tarballs. The format is taken from the file name
//! first; when the name says nothing the leading magic bytes decide.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Magic bytes, checked in this order
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Compression wrapped around the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCompression {
    /// Plain tar
    None,
    Gzip,
    Xz,
    Zstd,
}

impl ArchiveCompression {
    /// Guess from the archive file name, `None` when the name is inconclusive
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::Xz)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::Gzip)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
            Some(Self::Zstd)
        } else if name.ends_with(".tar") {
            Some(Self::None)
        } else {
            None
        }
    }

    /// Identify by leading bytes; anything unrecognized is treated as plain tar
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if data.starts_with(XZ_MAGIC) {
            Self::Xz
        } else if data.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Detect for a file on disk, reading its header only if the name is inconclusive
    pub fn detect(path: &Path) -> Result<Self> {
        let by_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_file_name);
        if let Some(format) = by_name {
            return Ok(format);
        }

        let mut header = [0u8; 6];
        let mut file = File::open(path).map_err(|e| open_error(path, e))?;
        let n = read_header(&mut file, &mut header).map_err(|e| open_error(path, e))?;
        Ok(Self::from_magic_bytes(&header[..n]))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "tar",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for ArchiveCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn open_error(path: &Path, e: io::Error) -> Error {
    Error::ExtractionError(format!("cannot open {}: {}", path.display(), e))
}

/// Fill as much of `buf` as the file provides
fn read_header(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Wrap `reader` in the decoder for `format`
pub fn decoder<'a, R: Read + 'a>(
    reader: R,
    format: ArchiveCompression,
) -> Result<Box<dyn Read + 'a>> {
    match format {
        ArchiveCompression::None => Ok(Box::new(reader)),
        ArchiveCompression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        ArchiveCompression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        ArchiveCompression::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| {
                Error::ExtractionError(format!("failed to create zstd decoder: {}", e))
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Open an archive file as a decompressed tar byte stream
pub fn open_archive(path: &Path) -> Result<Box<dyn Read>> {
    let format = ArchiveCompression::detect(path)?;
    let file = File::open(path).map_err(|e| open_error(path, e))?;
    decoder(BufReader::new(file), format)
}
