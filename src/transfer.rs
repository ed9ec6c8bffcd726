// src/transfer.rs

//! HTTP(S) retrieval of the archive and its trust artifacts
//!
//! Downloads are streamed to disk in fixed-size chunks. After every chunk the
//! caller's progress callback runs on the same thread; an error returned from
//! it (typically [`Error::Cancelled`] from the liveness check) aborts the
//! transfer immediately and removes the partial file.
//!
//! There are no retries and no resumption: one best-effort transfer per
//! artifact.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for HTTP requests (30 seconds)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming downloads (64 KB)
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Progress callback: (bytes so far, total bytes if known)
pub type ProgressCallback<'a> = dyn FnMut(u64, Option<u64>) -> Result<()> + 'a;

/// Retrieves a URL into a local file
pub trait Fetch: Send + Sync {
    /// Download `url` to `dest`, replacing any existing file
    ///
    /// Returns the number of bytes written.
    fn fetch(&self, url: &str, dest: &Path, on_progress: &mut ProgressCallback<'_>)
    -> Result<u64>;
}

/// Stream a reader into `file`, reporting progress after each chunk
fn stream_to_file(
    reader: &mut dyn Read,
    file: &mut File,
    total_size: Option<u64>,
    on_progress: &mut ProgressCallback<'_>,
) -> Result<u64> {
    let mut downloaded: u64 = 0;
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];

    on_progress(0, total_size)?;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::IoError(format!("Failed to read response: {e}")))?;

        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;

        downloaded += bytes_read as u64;
        on_progress(downloaded, total_size)?;
    }

    file.flush()
        .map_err(|e| Error::IoError(format!("Failed to flush download: {e}")))?;

    Ok(downloaded)
}

/// Remove a file if present, tolerating its absence
pub(crate) fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::IoError(format!(
            "Failed to remove stale file {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Blocking HTTP client
pub struct TransferClient {
    client: Client,
}

impl TransferClient {
    /// Create a new transfer client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .user_agent(concat!("stage3-bootstrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::IoError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn fetch_inner(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut ProgressCallback<'_>,
    ) -> Result<u64> {
        let mut response = self.client.get(url).send().map_err(|e| Error::TransferError {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(Error::TransferError {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let total_size = response.content_length();
        let mut file = File::create(dest).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", dest.display(), e))
        })?;

        stream_to_file(&mut response, &mut file, total_size, on_progress)
    }
}

impl Fetch for TransferClient {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut ProgressCallback<'_>,
    ) -> Result<u64> {
        info!("Downloading {}", url);
        remove_stale(dest)?;

        match self.fetch_inner(url, dest, on_progress) {
            Ok(bytes) => {
                info!("Downloaded {} bytes to {}", bytes, dest.display());
                Ok(bytes)
            }
            Err(e) => {
                if let Err(cleanup) = remove_stale(dest) {
                    warn!("{}", cleanup);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    /// Serve a single canned HTTP response on a loopback port
    fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let header = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            // The client may hang up early; that is part of some tests
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
        });

        format!("http://{}/stage3.tar.xz", addr)
    }

    #[test]
    fn test_fetch_writes_body_and_reports_progress() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("stage3.tar.xz");
        let body = vec![7u8; 200_000];
        let url = serve_once("200 OK", body.clone());

        let mut calls = Vec::new();
        let client = TransferClient::new().unwrap();
        let written = client
            .fetch(&url, &dest, &mut |done, total| {
                calls.push((done, total));
                Ok(())
            })
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), body);
        assert_eq!(calls.first(), Some(&(0, Some(200_000))));
        assert_eq!(calls.last(), Some(&(200_000, Some(200_000))));
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_not_found_is_transfer_error() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("stage3.tar.xz.asc");
        let url = serve_once("404 Not Found", b"missing".to_vec());

        let client = TransferClient::new().unwrap();
        let err = client.fetch(&url, &dest, &mut |_, _| Ok(())).unwrap_err();

        assert!(matches!(err, Error::TransferError { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_stale_file_is_replaced() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("stage3.tar.xz.sha256");
        fs::write(&dest, b"stale content that is longer than the new body").unwrap();
        let url = serve_once("200 OK", b"fresh".to_vec());

        let client = TransferClient::new().unwrap();
        client.fetch(&url, &dest, &mut |_, _| Ok(())).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"fresh");
    }

    #[test]
    fn test_progress_error_aborts_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("stage3.tar.xz");
        let url = serve_once("200 OK", vec![1u8; 500_000]);

        let client = TransferClient::new().unwrap();
        let err = client
            .fetch(&url, &dest, &mut |done, _| {
                if done > 0 {
                    Err(Error::Cancelled("parent gone".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();

        assert!(err.is_cancellation());
        assert!(!dest.exists());
    }

    #[test]
    fn test_unreachable_host_is_transfer_error() {
        let temp = TempDir::new().unwrap();
        // Bind then drop to get a port with nothing listening
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let url = format!("http://127.0.0.1:{}/stage3.tar.xz", port);

        let client = TransferClient::new().unwrap();
        let err = client
            .fetch(&url, &temp.path().join("x"), &mut |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::TransferError { .. }));
    }
}
