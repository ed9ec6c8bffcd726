// src/process.rs

//! Supervised execution of external commands
//!
//! Bootstrap steps run as child processes that are polled rather than
//! awaited, so the liveness check can interleave with the wait. When the
//! supervisor disappears the child is sent SIGTERM, given a grace period,
//! and then killed.
//!
//! Child stdout and stderr are piped and relayed line by line into the log,
//! so nothing a child prints reaches our own stdout (which may be carrying
//! machine-readable progress). The last lines are kept for error messages.

use crate::error::{Error, Result};
use crate::liveness::{Liveness, POLL_INTERVAL};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Time a terminated child gets before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Lines of child output kept for error messages
const OUTPUT_TAIL: usize = 20;

/// How long to wait for a relay to hit end of stream once the child exited
///
/// Daemons started by a bootstrap step can inherit the pipe and hold it open.
const RELAY_DRAIN: Duration = Duration::from_secs(2);

/// A command line to run, with optional extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run a shell snippet inside `root` through `chroot(1)`
    pub fn in_chroot(root: &Path, script: impl Into<String>) -> Self {
        Self::new("chroot")
            .arg(root.to_string_lossy())
            .arg("/bin/bash")
            .arg("-c")
            .arg(script)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Forwards one child output stream to the log, keeping its last lines
struct OutputRelay {
    tail: Arc<Mutex<VecDeque<String>>>,
    done: mpsc::Receiver<()>,
}

impl OutputRelay {
    fn spawn<R: Read + Send + 'static>(stream: R, label: String, is_stderr: bool) -> Self {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL)));
        let shared = Arc::clone(&tail);
        let (finished, done) = mpsc::channel();

        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if is_stderr {
                    warn!("[{}] {}", label, line);
                } else {
                    info!("[{}] {}", label, line);
                }
                let mut tail = shared.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == OUTPUT_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            // The receiver is gone if the runner stopped waiting
            finished.send(()).ok();
        });

        Self { tail, done }
    }

    /// Wait briefly for end of stream, then take the retained lines
    fn finish(self) -> Vec<String> {
        if self.done.recv_timeout(RELAY_DRAIN).is_err() {
            debug!("Child output still open after exit, not waiting further");
        }
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }
}

/// stdout and stderr relays of one child
struct ChildOutput {
    stdout: Option<OutputRelay>,
    stderr: Option<OutputRelay>,
}

impl ChildOutput {
    fn attach(child: &mut Child, label: &str) -> Self {
        Self {
            stdout: child
                .stdout
                .take()
                .map(|s| OutputRelay::spawn(s, label.to_string(), false)),
            stderr: child
                .stderr
                .take()
                .map(|s| OutputRelay::spawn(s, label.to_string(), true)),
        }
    }

    /// Last lines worth quoting: stderr if it said anything, else stdout
    fn finish(self) -> Vec<String> {
        let stdout = self.stdout.map(OutputRelay::finish).unwrap_or_default();
        let stderr = self.stderr.map(OutputRelay::finish).unwrap_or_default();
        if stderr.is_empty() { stdout } else { stderr }
    }
}

/// Runs commands to completion under liveness supervision
pub trait CommandRunner: Send + Sync {
    /// Run `command`, failing on non-zero exit or supervisor loss
    fn run(&self, command: &CommandSpec, liveness: &Liveness) -> Result<()>;
}

/// Spawns real child processes and polls them
#[derive(Debug, Clone)]
pub struct SupervisedRunner {
    poll_interval: Duration,
    grace: Duration,
}

impl Default for SupervisedRunner {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            grace: TERMINATE_GRACE,
        }
    }
}

impl SupervisedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set custom termination grace period
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn terminate(&self, child: &mut Child) {
        match i32::try_from(child.id()) {
            Ok(raw) => {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to pid {}: {}", raw, e);
                }
            }
            Err(_) => warn!("Child pid {} out of range for kill(2)", child.id()),
        }

        match child.wait_timeout(self.grace) {
            Ok(Some(status)) => debug!("Child exited after SIGTERM: {}", status),
            Ok(None) | Err(_) => {
                warn!(
                    "Child did not exit within {}s, killing",
                    self.grace.as_secs()
                );
                if let Err(e) = child.kill() {
                    warn!("Failed to kill child: {}", e);
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap killed child: {}", e);
                }
            }
        }
    }
}

impl CommandRunner for SupervisedRunner {
    fn run(&self, command: &CommandSpec, liveness: &Liveness) -> Result<()> {
        liveness.assert_parent_alive()?;
        info!("Running: {}", command);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BootstrapError(format!("failed to spawn `{}`: {}", command, e)))?;
        let output = ChildOutput::attach(&mut child, &command.program);

        loop {
            let waited = match child.wait_timeout(self.poll_interval) {
                Ok(waited) => waited,
                Err(e) => {
                    self.terminate(&mut child);
                    output.finish();
                    return Err(Error::BootstrapError(format!(
                        "failed to wait for `{}`: {}",
                        command, e
                    )));
                }
            };

            match waited {
                Some(status) if status.success() => {
                    output.finish();
                    debug!("Command completed: {}", command);
                    return Ok(());
                }
                Some(status) => {
                    let code = status.code().unwrap_or(-1);
                    let tail = output.finish();
                    let mut message = format!("`{}` exited with code {}", command, code);
                    if !tail.is_empty() {
                        message.push_str(": ");
                        message.push_str(&tail.join(" | "));
                    }
                    return Err(Error::BootstrapError(message));
                }
                None => {
                    if !liveness.is_parent_alive() {
                        self.terminate(&mut child);
                        output.finish();
                        return Err(Error::Cancelled(format!(
                            "supervising process exited while running `{}`",
                            command
                        )));
                    }
                }
            }
        }
    }
}
