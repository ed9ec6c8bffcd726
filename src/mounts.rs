// src/mounts.rs

//! Bind mounts around the chroot bootstrap
//!
//! A [`MountSession`] binds the host's pseudo-filesystems into the target
//! tree and owns them until it is dropped. Teardown always runs in reverse
//! order of setup with lazy (`MNT_DETACH`) unmounts, including when a
//! bootstrap command failed or a panic unwinds through the session. Teardown
//! failures are logged and never replace the error that caused the unwind.
//!
//! Live mode uses [`bind_live_root`] instead: the pre-populated image is
//! bound onto the target once and left in place for later installer steps.

use crate::error::{Error, Result};
use crate::liveness::Liveness;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host pseudo-filesystems bound into the target, in setup order
pub const PSEUDO_FILESYSTEMS: [&str; 4] = ["/proc", "/sys", "/dev", "/run"];

/// Performs the mount operations a session needs
pub trait Mounter: Send + Sync {
    /// Bind `source` onto `target`
    fn bind(&self, source: &Path, target: &Path) -> Result<()>;

    /// Lazily detach whatever is mounted at `target`
    fn detach(&self, target: &Path) -> Result<()>;
}

/// Uses mount(2) and umount2(2) directly
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallMounter;

impl Mounter for SyscallMounter {
    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            Error::MountError(format!(
                "bind {} onto {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })
    }

    fn detach(&self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
            .map_err(|e| Error::MountError(format!("unmount {}: {}", target.display(), e)))
    }
}

/// Path of host `source` inside `root`
fn inside(root: &Path, source: &str) -> PathBuf {
    root.join(source.trim_start_matches('/'))
}

/// Active bind mounts inside one target tree
pub struct MountSession {
    mounter: Arc<dyn Mounter>,
    root: PathBuf,
    active: Vec<PathBuf>,
}

impl MountSession {
    /// Bind every pseudo-filesystem into `root`
    ///
    /// If one bind fails, the ones already made are torn down before the
    /// error is returned.
    pub fn establish(mounter: Arc<dyn Mounter>, root: &Path, liveness: &Liveness) -> Result<Self> {
        let mut session = Self {
            mounter,
            root: root.to_path_buf(),
            active: Vec::with_capacity(PSEUDO_FILESYSTEMS.len()),
        };

        for source in PSEUDO_FILESYSTEMS {
            liveness.assert_parent_alive()?;
            let target = inside(root, source);
            fs::create_dir_all(&target).map_err(|e| {
                Error::MountError(format!("cannot create {}: {}", target.display(), e))
            })?;
            session.mounter.bind(Path::new(source), &target)?;
            debug!("Bound {} onto {}", source, target.display());
            session.active.push(target);
        }

        info!(
            "Mounted {} pseudo-filesystems under {}",
            session.active.len(),
            session.root.display()
        );
        Ok(session)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount targets currently held, in setup order
    pub fn active(&self) -> &[PathBuf] {
        &self.active
    }

    /// Tear down now instead of at drop
    pub fn release(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        while let Some(target) = self.active.pop() {
            match self.mounter.detach(&target) {
                Ok(()) => debug!("Detached {}", target.display()),
                Err(e) => warn!("Teardown: {}", e),
            }
        }
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Bind a pre-populated root image onto `target` (live mode)
pub fn bind_live_root(mounter: &dyn Mounter, source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(Error::MountError(format!(
            "live root image {} is not available",
            source.display()
        )));
    }
    fs::create_dir_all(target)
        .map_err(|e| Error::MountError(format!("cannot create {}: {}", target.display(), e)))?;

    info!(
        "Live mode: binding {} onto {}",
        source.display(),
        target.display()
    );
    mounter.bind(source, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ParentProbe;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records calls; can be told to fail a given bind
    #[derive(Default)]
    struct RecordingMounter {
        pub calls: Mutex<Vec<String>>,
        pub fail_bind_of: Option<&'static str>,
    }

    impl Mounter for RecordingMounter {
        fn bind(&self, source: &Path, target: &Path) -> Result<()> {
            if self.fail_bind_of == source.to_str() {
                return Err(Error::MountError(format!("refused {}", source.display())));
            }
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
            if target.ends_with("sys") {
                return Err(Error::MountError("target is busy".to_string()));
            }
            Ok(())
        }
    }

    struct Alive;
    impl ParentProbe for Alive {
        fn parent_pid(&self) -> u32 {
            4242
        }
    }

    fn detach_order(calls: &[String], root: &Path) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| c.strip_prefix("detach "))
            .map(|t| {
                Path::new(t)
                    .strip_prefix(root)
                    .unwrap()
                    .display()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_teardown_in_reverse_order() {
        let temp = TempDir::new().unwrap();
        let mounter = Arc::new(RecordingMounter::default());
        let liveness = Liveness::with_probe(Arc::new(Alive));

        let session = MountSession::establish(mounter.clone(), temp.path(), &liveness).unwrap();
        assert_eq!(session.active().len(), 4);
        assert!(temp.path().join("proc").is_dir());
        drop(session);

        let calls = mounter.calls.lock().unwrap();
        assert!(calls[0].starts_with("bind /proc"));
        assert!(calls[3].starts_with("bind /run"));
        // The busy /sys detach does not stop the rest
        assert_eq!(
            detach_order(&calls, temp.path()),
            vec!["run", "dev", "sys", "proc"]
        );
    }

    #[test]
    fn test_partial_setup_is_unwound() {
        let temp = TempDir::new().unwrap();
        let mounter = Arc::new(RecordingMounter {
            fail_bind_of: Some("/dev"),
            ..Default::default()
        });
        let liveness = Liveness::with_probe(Arc::new(Alive));

        let result = MountSession::establish(mounter.clone(), temp.path(), &liveness);
        assert!(matches!(result, Err(Error::MountError(_))));

        let calls = mounter.calls.lock().unwrap();
        assert_eq!(detach_order(&calls, temp.path()), vec!["sys", "proc"]);
    }

    #[test]
    fn test_teardown_runs_when_work_fails() {
        let temp = TempDir::new().unwrap();
        let mounter = Arc::new(RecordingMounter::default());
        let liveness = Liveness::with_probe(Arc::new(Alive));

        let outcome: Result<()> = (|| {
            let _session = MountSession::establish(mounter.clone(), temp.path(), &liveness)?;
            Err(Error::BootstrapError("emerge exited with code 1".to_string()))
        })();

        assert!(matches!(outcome, Err(Error::BootstrapError(_))));
        let calls = mounter.calls.lock().unwrap();
        assert_eq!(detach_order(&calls, temp.path()).len(), 4);
    }

    #[test]
    fn test_live_root_requires_source() {
        let temp = TempDir::new().unwrap();
        let mounter = RecordingMounter::default();
        let result = bind_live_root(
            &mounter,
            &temp.path().join("missing"),
            &temp.path().join("target"),
        );
        assert!(matches!(result, Err(Error::MountError(_))));
        assert!(mounter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_live_root_bound_once() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("rootfsbase");
        fs::create_dir(&source).unwrap();
        let target = temp.path().join("gentoo-rootfs");
        let mounter = RecordingMounter::default();

        bind_live_root(&mounter, &source, &target).unwrap();

        assert!(target.is_dir());
        let calls = mounter.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("bind "));
    }
}
