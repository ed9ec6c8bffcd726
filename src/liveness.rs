// src/liveness.rs

//! Supervisor liveness monitoring
//!
//! The pipeline runs as a child of the installer that launched it. When that
//! installer dies without shutting us down, the kernel re-parents us to init
//! (pid 1). Every long-running loop in this crate polls a [`Liveness`] handle
//! at its loop boundary so an orphaned run stops within one polling interval
//! instead of finishing unsupervised.
//!
//! Cancellation is cooperative: nothing here interrupts a hash update or a
//! file write already in progress.

use crate::error::{Error, Result};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Process id a parent-less process gets re-parented to
pub const INIT_PID: u32 = 1;

/// Polling interval for loops that wait on external work
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of the current parent process id
pub trait ParentProbe: Send + Sync {
    /// Current parent process id
    fn parent_pid(&self) -> u32;
}

/// Reads the real parent pid with `getppid(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemParent;

impl ParentProbe for SystemParent {
    fn parent_pid(&self) -> u32 {
        nix::unistd::getppid().as_raw().unsigned_abs()
    }
}

/// Cancellation handle threaded through every blocking operation
///
/// Clones share the same latch: once any clone observes the supervisor gone
/// (or [`Liveness::cancel`] is called), all clones report cancelled.
#[derive(Clone)]
pub struct Liveness {
    probe: Arc<dyn ParentProbe>,
    cancelled: Arc<AtomicBool>,
}

impl Liveness {
    /// Monitor the real parent process
    pub fn system() -> Self {
        Self::with_probe(Arc::new(SystemParent))
    }

    /// Monitor through a custom probe
    pub fn with_probe(probe: Arc<dyn ParentProbe>) -> Self {
        Self {
            probe,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the supervising process is still around
    pub fn is_parent_alive(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if self.probe.parent_pid() == INIT_PID {
            warn!("Supervising process exited, cancelling");
            self.cancelled.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Fail with [`Error::Cancelled`] when the supervisor is gone
    pub fn assert_parent_alive(&self) -> Result<()> {
        if self.is_parent_alive() {
            Ok(())
        } else {
            Err(Error::Cancelled("supervising process exited".to_string()))
        }
    }

    /// Request cancellation explicitly
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Liveness")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Reader that fails once the supervisor is gone
///
/// For handing a stream to a library that drains it internally, so the
/// liveness check happens at every buffer refill.
pub struct LivenessReader<R> {
    inner: R,
    liveness: Liveness,
}

impl<R: Read> LivenessReader<R> {
    pub fn new(inner: R, liveness: &Liveness) -> Self {
        Self {
            inner,
            liveness: liveness.clone(),
        }
    }
}

impl<R: Read> Read for LivenessReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Not ErrorKind::Interrupted: read loops retry that
        if !self.liveness.is_parent_alive() {
            return Err(io::Error::other("supervising process exited"));
        }
        self.inner.read(buf)
    }
}
