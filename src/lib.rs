// src/lib.rs

//! stage3-bootstrap
//!
//! Turns a Gentoo stage3 tarball into a bootstrapped root filesystem:
//! download the archive and its trust artifacts, verify them in a fixed
//! order, extract the tree, then run the bootstrap commands in a chroot with
//! the host pseudo-filesystems bound in.
//!
//! # Architecture
//!
//! - One pipeline run per invocation, driven by [`pipeline::Pipeline`]
//! - All run state lives in an explicit [`pipeline::PipelineContext`]
//! - Network, signatures, mounts and child processes sit behind traits
//!   ([`transfer::Fetch`], [`verify::ProvenanceCheck`], [`mounts::Mounter`],
//!   [`process::CommandRunner`])
//! - Every long loop checks [`liveness::Liveness`] and stops when the
//!   supervising installer is gone

pub mod bootstrap;
pub mod compression;
pub mod config;
mod error;
pub mod extract;
pub mod hash;
pub mod liveness;
pub mod manifest;
pub mod mounts;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod source;
pub mod transfer;
pub mod verify;

pub use config::{HostConfig, PipelineConfig};
pub use error::{Error, Result};
pub use liveness::Liveness;
pub use pipeline::{Pipeline, PipelineContext, PipelineState, RunOutcome};
pub use progress::{
    CliProgress, JsonProgress, LogProgress, MemoryProgress, ProgressEvent, ProgressSink,
    SilentProgress,
};
pub use source::{ArtifactKind, SourceLocation};
pub use verify::{StageOutcome, VerificationReport};
