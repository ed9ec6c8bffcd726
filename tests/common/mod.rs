// tests/common/mod.rs

//! Shared fixtures for pipeline integration tests.
//!
//! A [`Mirror`] directory stands in for the release server: the fake fetcher
//! serves files from it by the last path segment of the requested URL and
//! answers everything else with a transfer error.

#![allow(dead_code)]

use stage3_bootstrap::config::PipelineConfig;
use stage3_bootstrap::hash::{HashAlgorithm, hash_bytes};
use stage3_bootstrap::liveness::{Liveness, ParentProbe};
use stage3_bootstrap::mounts::Mounter;
use stage3_bootstrap::pipeline::{Pipeline, PipelineContext};
use stage3_bootstrap::process::{CommandRunner, CommandSpec};
use stage3_bootstrap::progress::MemoryProgress;
use stage3_bootstrap::source::SourceLocation;
use stage3_bootstrap::transfer::{Fetch, ProgressCallback};
use stage3_bootstrap::verify::ProvenanceCheck;
use stage3_bootstrap::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use xz2::write::XzEncoder;

pub const ARCHIVE_NAME: &str = "stage3-amd64-openrc-20240101T170000Z.tar.xz";
pub const RELEASE_DIR: &str =
    "https://distfiles.example.org/releases/amd64/autobuilds/20240101T170000Z";

pub fn archive_url(name: &str) -> String {
    format!("{}/{}", RELEASE_DIR, name)
}

/// Parent that never goes away
pub struct Supervised;

impl ParentProbe for Supervised {
    fn parent_pid(&self) -> u32 {
        4242
    }
}

pub fn liveness() -> Liveness {
    Liveness::with_probe(Arc::new(Supervised))
}

/// Build a small stage3-like `.tar.xz` in memory
pub fn build_stage3() -> Vec<u8> {
    let encoder = XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);

    let dirs = [
        "bin",
        "etc",
        "etc/portage",
        "usr",
        "usr/bin",
        "var",
        "var/cache",
        "var/cache/distfiles",
        "var/cache/binpkgs",
        "var/db/repos/gentoo",
    ];
    for dir in dirs {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(1_704_128_400);
        header.set_cksum();
        builder
            .append_data(&mut header, dir, std::io::empty())
            .unwrap();
    }

    let files: [(&str, &[u8], u32); 4] = [
        ("etc/os-release", b"NAME=Gentoo\nID=gentoo\n", 0o644),
        ("bin/busybox", b"\x7fELF not really", 0o755),
        ("var/cache/distfiles/gcc-13.2.0.tar.xz", b"distfile", 0o644),
        ("var/db/repos/gentoo/metadata.xml", b"<catmetadata/>", 0o644),
    ];
    for (path, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(1_704_128_400);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder
        .append_link(&mut header, "usr/bin/sh", "../../bin/busybox")
        .unwrap();

    let encoder = builder.into_inner().unwrap();
    encoder.finish().unwrap()
}

pub fn sha256_line(data: &[u8], name: &str) -> String {
    format!(
        "# SHA256 HASH\n{}  {}\n",
        hash_bytes(HashAlgorithm::Sha256, data),
        name
    )
}

/// DIGESTS text listing BLAKE2b and SHA-512 for `name`
pub fn digests_text(data: &[u8], name: &str) -> String {
    format!(
        "# BLAKE2B HASH\n{blake}  {name}\n{blake_other}  {name}.CONTENTS.gz\n# SHA512 HASH\n{sha}  {name}\n",
        blake = hash_bytes(HashAlgorithm::Blake2b512, data),
        blake_other = hash_bytes(HashAlgorithm::Blake2b512, b"contents"),
        sha = hash_bytes(HashAlgorithm::Sha512, data),
        name = name,
    )
}

/// Release server contents
pub struct Mirror {
    pub dir: PathBuf,
}

impl Mirror {
    pub fn publish(&self, name: &str, data: &[u8]) {
        fs::write(self.dir.join(name), data).unwrap();
    }

    /// Archive, checksum, fake signature and plain-text manifest
    pub fn publish_release(&self, name: &str, archive: &[u8]) {
        self.publish(name, archive);
        self.publish(&format!("{}.sha256", name), sha256_line(archive, name).as_bytes());
        self.publish(&format!("{}.asc", name), b"signature");
        self.publish(
            &format!("{}.DIGESTS", name),
            digests_text(archive, name).as_bytes(),
        );
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.dir.join(name)).unwrap();
    }
}

/// Serves files out of a [`Mirror`]
pub struct MirrorFetcher {
    dir: PathBuf,
    pub requests: Mutex<Vec<String>>,
    /// Cancel this handle once the named file has been served
    cancel_after: Option<(String, Liveness)>,
}

impl MirrorFetcher {
    pub fn new(mirror: &Mirror) -> Self {
        Self {
            dir: mirror.dir.clone(),
            requests: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    pub fn cancelling_after(mut self, name: &str, liveness: Liveness) -> Self {
        self.cancel_after = Some((name.to_string(), liveness));
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetch for MirrorFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut ProgressCallback<'_>,
    ) -> Result<u64> {
        self.requests.lock().unwrap().push(url.to_string());
        let name = url.rsplit('/').next().unwrap_or(url);
        let data = fs::read(self.dir.join(name)).map_err(|_| Error::TransferError {
            url: url.to_string(),
            reason: "HTTP 404 Not Found".to_string(),
        })?;

        let total = data.len() as u64;
        on_progress(0, Some(total))?;
        let mut file = fs::File::create(dest)?;
        for (index, chunk) in data.chunks(512).enumerate() {
            file.write_all(chunk)?;
            let done = ((index + 1) * 512).min(data.len()) as u64;
            on_progress(done, Some(total))?;
        }

        if let Some((cancel_name, liveness)) = &self.cancel_after {
            if cancel_name == name {
                liveness.cancel();
            }
        }
        Ok(total)
    }
}

/// Accepts everything unless told otherwise; manifests are read as plain text
#[derive(Default)]
pub struct FakeProvenance {
    pub reject_signatures: bool,
    pub calls: Mutex<Vec<String>>,
}

impl ProvenanceCheck for FakeProvenance {
    fn verify_detached(&self, data: &Path, _signature: &Path, liveness: &Liveness) -> Result<()> {
        liveness.assert_parent_alive()?;
        self.calls
            .lock()
            .unwrap()
            .push(format!("detached {}", data.display()));
        if self.reject_signatures {
            return Err(Error::ProvenanceError(
                "signature made by an unexpected key".to_string(),
            ));
        }
        Ok(())
    }

    fn verify_signed(&self, signed: &Path) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("signed {}", signed.display()));
        Ok(fs::read(signed)?)
    }
}

#[derive(Default)]
pub struct RecordingMounter {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingMounter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Mounter for RecordingMounter {
    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("bind {} {}", source.display(), target.display()));
        Ok(())
    }

    fn detach(&self, target: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("detach {}", target.display()));
        Ok(())
    }
}

/// Records the chroot scripts; can fail at a given index
#[derive(Default)]
pub struct RecordingRunner {
    pub scripts: Mutex<Vec<String>>,
    pub fail_at: Option<usize>,
}

impl RecordingRunner {
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &CommandSpec, liveness: &Liveness) -> Result<()> {
        liveness.assert_parent_alive()?;
        let mut scripts = self.scripts.lock().unwrap();
        scripts.push(command.args.last().cloned().unwrap_or_default());
        if Some(scripts.len() - 1) == self.fail_at {
            return Err(Error::BootstrapError(format!(
                "`{}` exited with code 1",
                command
            )));
        }
        Ok(())
    }
}

/// Everything one pipeline run touches, rooted in a temp dir
pub struct Harness {
    pub temp: TempDir,
    pub mirror: Mirror,
    pub config: PipelineConfig,
    pub fetcher: Arc<MirrorFetcher>,
    pub provenance: Arc<dyn ProvenanceCheck>,
    pub mounter: Arc<RecordingMounter>,
    pub runner: Arc<RecordingRunner>,
    pub sink: Arc<MemoryProgress>,
    pub liveness: Liveness,
}

impl Harness {
    pub fn new() -> Self {
        Self::for_archive(ARCHIVE_NAME)
    }

    pub fn for_archive(name: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let mirror_dir = temp.path().join("mirror");
        fs::create_dir(&mirror_dir).unwrap();
        let mirror = Mirror { dir: mirror_dir };

        let host = temp.path().join("host");
        fs::create_dir(&host).unwrap();
        fs::write(host.join("resolv.conf"), "nameserver 192.0.2.53\n").unwrap();
        fs::write(
            host.join("gentoobinhost.conf"),
            "[gentoobinhost]\npriority = 9999\nsync-uri = https://distfiles.gentoo.org/releases/amd64/binpackages/23.0/x86-64\n",
        )
        .unwrap();

        let config = PipelineConfig {
            live: false,
            source: Some(SourceLocation::new(&archive_url(name), name).unwrap()),
            target: temp.path().join("gentoo-rootfs"),
            work_dir: temp.path().join("work"),
            live_source: temp.path().join("rootfsbase"),
            keyring: temp.path().join("gentoo-release.asc"),
            resolv_conf: host.join("resolv.conf"),
            binhost_conf: host.join("gentoobinhost.conf"),
            prune_repository_metadata: false,
            encrypted_root: false,
        };

        let fetcher = Arc::new(MirrorFetcher::new(&mirror));
        Self {
            temp,
            mirror,
            config,
            fetcher,
            provenance: Arc::new(FakeProvenance::default()),
            mounter: Arc::new(RecordingMounter::default()),
            runner: Arc::new(RecordingRunner::default()),
            sink: Arc::new(MemoryProgress::new()),
            liveness: liveness(),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.fetcher.clone(),
            self.provenance.clone(),
            self.mounter.clone(),
            self.runner.clone(),
        )
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(
            self.config.clone(),
            self.liveness.clone(),
            self.sink.clone(),
        )
    }

    pub fn target(&self) -> &Path {
        &self.config.target
    }

    /// Files left in the download directory
    pub fn leftover_downloads(&self) -> Vec<String> {
        match fs::read_dir(&self.config.work_dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
