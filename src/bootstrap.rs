// src/bootstrap.rs

//! Making a freshly extracted stage3 tree self-hosting
//!
//! Three steps, all inside the target root:
//!
//! 1. [`Bootstrap::prepare_tree`] copies host files (resolver config, binary
//!    package host config) and writes the portage and dracut snippets. This
//!    happens before any package is installed so first-time install hooks
//!    (installkernel, dracut) see the intended configuration.
//! 2. [`Bootstrap::run`] executes the fixed chroot command sequence under the
//!    bind mounts held by the caller.
//! 3. [`Bootstrap::clean_caches`] empties the distfile and binary package
//!    caches, and optionally drops the repository snapshot.

use crate::error::{Error, Result};
use crate::liveness::Liveness;
use crate::process::{CommandRunner, CommandSpec};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PACKAGE_USE_FILE: &str = "etc/portage/package.use/00-livecd.package.use";
pub const DRACUT_CONF_FILE: &str = "etc/dracut.conf.d/10-installer.conf";
pub const BINHOST_CONF_FILE: &str = "etc/portage/binrepos.conf/gentoobinhost.conf";
pub const RESOLV_CONF_FILE: &str = "etc/resolv.conf";

/// Package manager caches emptied after bootstrap
pub const CACHE_DIRS: [&str; 2] = ["var/cache/distfiles", "var/cache/binpkgs"];

/// Repository snapshot removed when pruning is requested
pub const REPOSITORY_DIR: &str = "var/db/repos/gentoo";

const PACKAGE_USE: &str = ">=sys-kernel/installkernel-50 dracut\n";
const GETBINPKG: &str = r#"EMERGE_DEFAULT_OPTS="${EMERGE_DEFAULT_OPTS} --getbinpkg""#;
const BASE_PACKAGES: [&str; 2] = ["sys-apps/dbus", "sys-boot/grub"];
const CRYPTSETUP: &str = "sys-fs/cryptsetup";

/// Init system the stage3 was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProfile {
    OpenRc,
    Systemd,
}

impl InitProfile {
    /// Inferred from the archive name, e.g. `stage3-amd64-systemd-*.tar.xz`
    pub fn from_archive_name(name: &str) -> Self {
        if name.to_ascii_lowercase().contains("systemd") {
            Self::Systemd
        } else {
            Self::OpenRc
        }
    }
}

impl fmt::Display for InitProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRc => write!(f, "openrc"),
            Self::Systemd => write!(f, "systemd"),
        }
    }
}

/// Bootstrap plan for one target tree
#[derive(Debug, Clone)]
pub struct Bootstrap {
    root: PathBuf,
    profile: InitProfile,
    encrypted_root: bool,
    host_resolv_conf: PathBuf,
    host_binhost_conf: PathBuf,
    prune_repository: bool,
}

impl Bootstrap {
    pub fn new(root: impl Into<PathBuf>, profile: InitProfile) -> Self {
        Self {
            root: root.into(),
            profile,
            encrypted_root: false,
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
            host_binhost_conf: PathBuf::from("/").join(BINHOST_CONF_FILE),
            prune_repository: false,
        }
    }

    /// Root filesystem lives on a LUKS volume
    pub fn with_encrypted_root(mut self, encrypted: bool) -> Self {
        self.encrypted_root = encrypted;
        self
    }

    /// Host files copied into the tree
    pub fn with_host_files(mut self, resolv_conf: &Path, binhost_conf: &Path) -> Self {
        self.host_resolv_conf = resolv_conf.to_path_buf();
        self.host_binhost_conf = binhost_conf.to_path_buf();
        self
    }

    /// Also remove the repository snapshot during cleanup
    pub fn with_repository_pruning(mut self, prune: bool) -> Self {
        self.prune_repository = prune;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile(&self) -> InitProfile {
        self.profile
    }

    fn in_root(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Copy host files and write configuration snippets
    pub fn prepare_tree(&self) -> Result<()> {
        copy_into(&self.host_resolv_conf, &self.in_root(RESOLV_CONF_FILE))?;

        let binhost = self.in_root(BINHOST_CONF_FILE);
        if self.host_binhost_conf.exists() {
            copy_into(&self.host_binhost_conf, &binhost)?;
        } else {
            warn!(
                "{} does not exist, binary packages use the stage3 defaults",
                self.host_binhost_conf.display()
            );
        }

        write_into(&self.in_root(PACKAGE_USE_FILE), PACKAGE_USE)?;
        write_into(&self.in_root(DRACUT_CONF_FILE), &self.dracut_config())?;

        info!(
            "Prepared {} tree at {} (encrypted root: {})",
            self.profile,
            self.root.display(),
            self.encrypted_root
        );
        Ok(())
    }

    /// dracut drop-in honoured by installkernel
    pub fn dracut_config(&self) -> String {
        let mut config = String::from("hostonly=\"yes\"\nearly_microcode=\"yes\"\n");
        if self.encrypted_root {
            config.push_str("add_dracutmodules+=\" crypt dm rootfs-block \"\n");
        }
        config
    }

    /// Packages installed from the binary host
    pub fn packages(&self) -> Vec<&'static str> {
        let mut packages = BASE_PACKAGES.to_vec();
        // systemd's dracut modules bring their own cryptsetup
        if self.encrypted_root && self.profile == InitProfile::OpenRc {
            packages.push(CRYPTSETUP);
        }
        packages
    }

    /// The chroot command sequence, in order
    pub fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::in_chroot(&self.root, "getuto"),
            CommandSpec::in_chroot(&self.root, "emerge-webrsync -q"),
            CommandSpec::in_chroot(
                &self.root,
                format!("{} emerge -q {}", GETBINPKG, self.packages().join(" ")),
            ),
            CommandSpec::in_chroot(&self.root, format!("{} emerge -q1 timezone-data", GETBINPKG)),
        ]
    }

    /// Run every command; the first failure stops the sequence
    ///
    /// `on_step` is called with (index, count) before each command.
    pub fn run(
        &self,
        runner: &dyn CommandRunner,
        liveness: &Liveness,
        on_step: &mut dyn FnMut(usize, usize) -> Result<()>,
    ) -> Result<()> {
        let commands = self.commands();
        let count = commands.len();
        for (index, command) in commands.iter().enumerate() {
            on_step(index, count)?;
            runner.run(command, liveness)?;
        }
        info!("Bootstrap commands completed in {}", self.root.display());
        Ok(())
    }

    /// Remove package caches; failures are logged only
    pub fn clean_caches(&self) {
        for dir in CACHE_DIRS {
            empty_dir(&self.in_root(dir));
        }
        if self.prune_repository {
            let repo = self.in_root(REPOSITORY_DIR);
            match fs::remove_dir_all(&repo) {
                Ok(()) => info!("Removed repository snapshot {}", repo.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", repo.display(), e),
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::BootstrapError(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

fn copy_into(source: &Path, dest: &Path) -> Result<()> {
    ensure_parent(dest)?;
    // resolv.conf is often a symlink in the stage3; replace it rather than follow it
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).map_err(|e| {
            Error::BootstrapError(format!("cannot replace {}: {}", dest.display(), e))
        })?;
    }
    fs::copy(source, dest).map_err(|e| {
        Error::BootstrapError(format!(
            "cannot copy {} to {}: {}",
            source.display(),
            dest.display(),
            e
        ))
    })?;
    debug!("Copied {} to {}", source.display(), dest.display());
    Ok(())
}

fn write_into(dest: &Path, content: &str) -> Result<()> {
    ensure_parent(dest)?;
    fs::write(dest, content)
        .map_err(|e| Error::BootstrapError(format!("cannot write {}: {}", dest.display(), e)))?;
    debug!("Wrote {}", dest.display());
    Ok(())
}

fn empty_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        if let Err(e) = removed {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
    debug!("Emptied {}", dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ParentProbe;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Alive;
    impl ParentProbe for Alive {
        fn parent_pid(&self) -> u32 {
            4242
        }
    }

    #[derive(Default)]
    struct ScriptedRunner {
        seen: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &CommandSpec, _liveness: &Liveness) -> Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(command.args.last().cloned().unwrap_or_default());
            if Some(seen.len() - 1) == self.fail_at {
                return Err(Error::BootstrapError(format!("`{}` exited with code 1", command)));
            }
            Ok(())
        }
    }

    fn host_files(temp: &TempDir, with_binhost: bool) -> (PathBuf, PathBuf) {
        let resolv = temp.path().join("host-resolv.conf");
        fs::write(&resolv, "nameserver 192.0.2.53\n").unwrap();
        let binhost = temp.path().join("host-binhost.conf");
        if with_binhost {
            fs::write(&binhost, "[gentoobinhost]\npriority = 9999\n").unwrap();
        }
        (resolv, binhost)
    }

    #[test]
    fn test_profile_from_archive_name() {
        assert_eq!(
            InitProfile::from_archive_name("stage3-amd64-systemd-20240101T170000Z.tar.xz"),
            InitProfile::Systemd
        );
        assert_eq!(
            InitProfile::from_archive_name("stage3-amd64-openrc-20240101T170000Z.tar.xz"),
            InitProfile::OpenRc
        );
    }

    #[test]
    fn test_prepare_tree_writes_snippets() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink("/run/resolv.conf", root.join(RESOLV_CONF_FILE)).unwrap();
        let (resolv, binhost) = host_files(&temp, true);

        Bootstrap::new(&root, InitProfile::OpenRc)
            .with_host_files(&resolv, &binhost)
            .prepare_tree()
            .unwrap();

        let copied = root.join(RESOLV_CONF_FILE);
        assert!(!copied.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_to_string(copied).unwrap(),
            "nameserver 192.0.2.53\n"
        );
        assert!(root.join(BINHOST_CONF_FILE).exists());
        assert_eq!(
            fs::read_to_string(root.join(PACKAGE_USE_FILE)).unwrap(),
            ">=sys-kernel/installkernel-50 dracut\n"
        );
        assert!(
            !fs::read_to_string(root.join(DRACUT_CONF_FILE))
                .unwrap()
                .contains("crypt")
        );
    }

    #[test]
    fn test_missing_binhost_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        let (resolv, binhost) = host_files(&temp, false);

        Bootstrap::new(&root, InitProfile::OpenRc)
            .with_host_files(&resolv, &binhost)
            .prepare_tree()
            .unwrap();
        assert!(!root.join(BINHOST_CONF_FILE).exists());
    }

    #[test]
    fn test_encrypted_openrc_adds_cryptsetup() {
        let openrc = Bootstrap::new("/mnt/gentoo-rootfs", InitProfile::OpenRc)
            .with_encrypted_root(true);
        assert!(openrc.packages().contains(&"sys-fs/cryptsetup"));
        assert!(openrc.dracut_config().contains("crypt dm rootfs-block"));

        let systemd = Bootstrap::new("/mnt/gentoo-rootfs", InitProfile::Systemd)
            .with_encrypted_root(true);
        assert!(!systemd.packages().contains(&"sys-fs/cryptsetup"));
        assert!(systemd.dracut_config().contains("crypt"));
    }

    #[test]
    fn test_command_sequence() {
        let bootstrap = Bootstrap::new("/mnt/gentoo-rootfs", InitProfile::OpenRc);
        let scripts: Vec<String> = bootstrap
            .commands()
            .iter()
            .map(|c| c.args.last().cloned().unwrap())
            .collect();
        assert_eq!(
            scripts,
            vec![
                "getuto".to_string(),
                "emerge-webrsync -q".to_string(),
                r#"EMERGE_DEFAULT_OPTS="${EMERGE_DEFAULT_OPTS} --getbinpkg" emerge -q sys-apps/dbus sys-boot/grub"#.to_string(),
                r#"EMERGE_DEFAULT_OPTS="${EMERGE_DEFAULT_OPTS} --getbinpkg" emerge -q1 timezone-data"#.to_string(),
            ]
        );
        assert!(bootstrap.commands().iter().all(|c| c.program == "chroot"));
    }

    #[test]
    fn test_first_failure_stops_sequence() {
        let runner = ScriptedRunner {
            fail_at: Some(1),
            ..Default::default()
        };
        let liveness = Liveness::with_probe(Arc::new(Alive));
        let bootstrap = Bootstrap::new("/mnt/gentoo-rootfs", InitProfile::OpenRc);

        let mut steps = Vec::new();
        let err = bootstrap
            .run(&runner, &liveness, &mut |i, n| {
                steps.push((i, n));
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::BootstrapError(_)));
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
        assert_eq!(steps, vec![(0, 4), (1, 4)]);
    }

    #[test]
    fn test_clean_caches() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for dir in CACHE_DIRS {
            fs::create_dir_all(root.join(dir).join("sub")).unwrap();
            fs::write(root.join(dir).join("pkg.tbz2"), b"x").unwrap();
        }
        fs::create_dir_all(root.join(REPOSITORY_DIR).join("sys-apps")).unwrap();

        Bootstrap::new(root, InitProfile::OpenRc).clean_caches();
        for dir in CACHE_DIRS {
            assert!(root.join(dir).is_dir());
            assert_eq!(fs::read_dir(root.join(dir)).unwrap().count(), 0);
        }
        assert!(root.join(REPOSITORY_DIR).exists());

        Bootstrap::new(root, InitProfile::OpenRc)
            .with_repository_pruning(true)
            .clean_caches();
        assert!(!root.join(REPOSITORY_DIR).exists());
    }
}
