// src/pipeline.rs

//! Pipeline controller
//!
//! Sequences one end-to-end run:
//!
//! ```text
//! Idle -> FetchingArchive -> FetchingChecksum -> FetchingSignature -> FetchingManifest
//!      -> VerifyingChecksum -> VerifyingSignature -> VerifyingManifest
//!      -> Extracting -> Bootstrapping -> CleaningUp -> Done
//! ```
//!
//! Any state can move to `Aborted`. Live mode skips straight from `Idle` to
//! `Done` after binding the pre-populated root image.
//!
//! All run state (current state, monotonic progress, cancellation handle,
//! configuration) lives in a [`PipelineContext`] passed by reference into
//! each stage. External effects go through the [`Fetch`], [`ProvenanceCheck`],
//! [`Mounter`] and [`CommandRunner`] seams held by [`Pipeline`].

use crate::bootstrap::{Bootstrap, InitProfile};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::extract::{self, ExtractionSummary};
use crate::liveness::Liveness;
use crate::mounts::{self, MountSession, Mounter, SyscallMounter};
use crate::process::{CommandRunner, SupervisedRunner};
use crate::progress::{Progress, ProgressRange, ProgressSink};
use crate::source::{ArtifactKind, SourceLocation};
use crate::transfer::{Fetch, TransferClient, remove_stale};
use crate::verify::{
    ProvenanceCheck, TrustArtifactSet, VerificationChain, VerificationReport, VerifyStage,
    release_verifier,
};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    FetchingArchive,
    FetchingChecksum,
    FetchingSignature,
    FetchingManifest,
    VerifyingChecksum,
    VerifyingSignature,
    VerifyingManifest,
    Extracting,
    Bootstrapping,
    CleaningUp,
    Done,
    Aborted,
}

impl PipelineState {
    /// Share of the overall progress scale owned by this state
    pub fn range(&self) -> ProgressRange {
        match self {
            Self::Idle => ProgressRange::new(0.0, 0.0),
            Self::FetchingArchive => ProgressRange::new(0.0, 38.0),
            Self::FetchingChecksum => ProgressRange::new(38.0, 40.0),
            Self::FetchingSignature => ProgressRange::new(40.0, 42.0),
            Self::FetchingManifest => ProgressRange::new(42.0, 44.0),
            Self::VerifyingChecksum => ProgressRange::new(44.0, 46.0),
            Self::VerifyingSignature => ProgressRange::new(46.0, 47.0),
            Self::VerifyingManifest => ProgressRange::new(47.0, 48.0),
            Self::Extracting => ProgressRange::new(48.0, 96.0),
            Self::Bootstrapping => ProgressRange::new(96.0, 99.0),
            Self::CleaningUp => ProgressRange::new(99.0, 100.0),
            Self::Done => ProgressRange::new(100.0, 100.0),
            Self::Aborted => ProgressRange::new(0.0, 0.0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// State that fetches `kind`
    pub fn fetching(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Archive => Self::FetchingArchive,
            ArtifactKind::Checksum => Self::FetchingChecksum,
            ArtifactKind::Signature => Self::FetchingSignature,
            ArtifactKind::Manifest => Self::FetchingManifest,
        }
    }

    /// State that runs verification `stage`
    pub fn verifying(stage: VerifyStage) -> Self {
        match stage {
            VerifyStage::Checksum => Self::VerifyingChecksum,
            VerifyStage::Signature => Self::VerifyingSignature,
            VerifyStage::Manifest => Self::VerifyingManifest,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Idle => "Waiting to start",
            Self::FetchingArchive => "Downloading stage3 archive",
            Self::FetchingChecksum => "Downloading checksum",
            Self::FetchingSignature => "Downloading signature",
            Self::FetchingManifest => "Downloading digest manifest",
            Self::VerifyingChecksum => "Verifying checksum",
            Self::VerifyingSignature => "Verifying signature",
            Self::VerifyingManifest => "Verifying digest manifest",
            Self::Extracting => "Extracting stage3",
            Self::Bootstrapping => "Bootstrapping target",
            Self::CleaningUp => "Cleaning up",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Per-run state threaded through every stage
pub struct PipelineContext {
    config: PipelineConfig,
    liveness: Liveness,
    sink: Arc<dyn ProgressSink>,
    progress: Progress,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, liveness: Liveness, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            config,
            liveness,
            sink,
            progress: Progress::new(),
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Current overall progress in [0, 100]
    pub fn progress(&self) -> f64 {
        self.progress.value()
    }

    /// Enter a non-terminal state, checking liveness first
    pub fn enter(&mut self, state: PipelineState) -> Result<()> {
        self.liveness.assert_parent_alive()?;
        self.transition(state);
        self.set_progress(state.range().start);
        Ok(())
    }

    /// Report a fraction of the current state's range
    pub fn advance_within(&mut self, fraction: f64) {
        let value = self.state.range().at(fraction);
        self.set_progress(value);
    }

    /// Report an absolute value; ignored if it would move backwards
    pub fn set_progress(&mut self, value: f64) {
        if self.progress.advance(value) {
            self.sink
                .report(self.progress.value(), self.state.description());
        }
    }

    fn transition(&mut self, state: PipelineState) {
        debug!("Pipeline state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn finish(&mut self, message: &str) {
        self.transition(PipelineState::Done);
        self.progress.advance(Progress::MAX);
        self.sink.finish(message);
    }

    fn abort(&mut self, err: &Error) {
        self.transition(PipelineState::Aborted);
        error!("Pipeline aborted during {} stage: {}", err.stage(), err);
        self.sink.fail(&err.to_string());
    }
}

/// What a successful run did
#[derive(Debug)]
pub enum RunOutcome {
    /// Downloaded, verified, extracted and bootstrapped
    Installed {
        report: VerificationReport,
        extraction: ExtractionSummary,
        profile: InitProfile,
    },
    /// Bound the live root image onto the target
    LiveBound { source: PathBuf, target: PathBuf },
}

/// Downloaded files, removed when dropped
struct DownloadedArtifacts {
    paths: Vec<PathBuf>,
}

impl DownloadedArtifacts {
    fn new(source: &SourceLocation, work_dir: &Path) -> Self {
        Self {
            paths: ArtifactKind::all()
                .iter()
                .map(|kind| source.local_path(work_dir, *kind))
                .collect(),
        }
    }
}

impl Drop for DownloadedArtifacts {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = remove_stale(path) {
                warn!("{}", e);
            }
        }
    }
}

/// The pipeline's collaborators
pub struct Pipeline {
    fetcher: Arc<dyn Fetch>,
    provenance: Arc<dyn ProvenanceCheck>,
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        provenance: Arc<dyn ProvenanceCheck>,
        mounter: Arc<dyn Mounter>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            fetcher,
            provenance,
            mounter,
            runner,
        }
    }

    /// Real network, keyring, mounts and child processes
    pub fn system(config: &PipelineConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(TransferClient::new()?),
            release_verifier(&config.keyring),
            Arc::new(SyscallMounter),
            Arc::new(SupervisedRunner::new()),
        ))
    }

    /// Run to completion, aborting on the first fatal error
    pub fn run(&self, ctx: &mut PipelineContext) -> Result<RunOutcome> {
        match self.run_stages(ctx) {
            Ok(outcome) => {
                ctx.finish("Stage3 ready");
                Ok(outcome)
            }
            Err(e) => {
                ctx.abort(&e);
                Err(e)
            }
        }
    }

    /// Download and verify only; the target tree is left alone
    pub fn verify_only(&self, ctx: &mut PipelineContext) -> Result<VerificationReport> {
        let result = (|| {
            let source = ctx.config().source()?.clone();
            let _artifacts = DownloadedArtifacts::new(&source, &ctx.config().work_dir);
            let set = self.fetch_all(ctx, &source)?;
            self.verify(ctx, &set)
        })();

        match result {
            Ok(report) => {
                ctx.finish("Stage3 verified");
                Ok(report)
            }
            Err(e) => {
                ctx.abort(&e);
                Err(e)
            }
        }
    }

    fn run_stages(&self, ctx: &mut PipelineContext) -> Result<RunOutcome> {
        if ctx.config().live {
            let source = ctx.config().live_source.clone();
            let target = ctx.config().target.clone();
            ctx.liveness().assert_parent_alive()?;
            mounts::bind_live_root(self.mounter.as_ref(), &source, &target)?;
            return Ok(RunOutcome::LiveBound { source, target });
        }

        let source = ctx.config().source()?.clone();
        let target = ctx.config().target.clone();
        let artifacts = DownloadedArtifacts::new(&source, &ctx.config().work_dir);

        let set = self.fetch_all(ctx, &source)?;
        let report = self.verify(ctx, &set)?;
        let extraction = self.extract(ctx, &set.archive, &target)?;
        // Reclaim the space before bootstrap downloads anything
        drop(artifacts);

        let profile = InitProfile::from_archive_name(source.archive_name());
        self.bootstrap(ctx, &target, profile)?;

        Ok(RunOutcome::Installed {
            report,
            extraction,
            profile,
        })
    }

    fn fetch_all(
        &self,
        ctx: &mut PipelineContext,
        source: &SourceLocation,
    ) -> Result<TrustArtifactSet> {
        let work_dir = ctx.config().work_dir.clone();
        fs::create_dir_all(&work_dir)?;

        let mut set = TrustArtifactSet {
            archive_name: source.archive_name().to_string(),
            archive: source.local_path(&work_dir, ArtifactKind::Archive),
            checksum: source.local_path(&work_dir, ArtifactKind::Checksum),
            signature: None,
            manifest: None,
        };

        for &kind in ArtifactKind::all() {
            ctx.enter(PipelineState::fetching(kind))?;
            let url = source.url_for(kind);
            let dest = source.local_path(&work_dir, kind);
            let liveness = ctx.liveness().clone();

            let fetched = self.fetcher.fetch(&url, &dest, &mut |done, total| {
                liveness.assert_parent_alive()?;
                let value = ctx.state().range().ratio(done, total);
                ctx.set_progress(value);
                Ok(())
            });

            match fetched {
                Ok(_) => match kind {
                    ArtifactKind::Signature => set.signature = Some(dest),
                    ArtifactKind::Manifest => set.manifest = Some(dest),
                    ArtifactKind::Archive | ArtifactKind::Checksum => {}
                },
                Err(e) if e.is_cancellation() || kind.is_mandatory() => return Err(e),
                Err(e) => warn!("{} unavailable, continuing without it: {}", kind, e),
            }
        }

        Ok(set)
    }

    fn verify(
        &self,
        ctx: &mut PipelineContext,
        set: &TrustArtifactSet,
    ) -> Result<VerificationReport> {
        let liveness = ctx.liveness().clone();
        let chain = VerificationChain::new(self.provenance.as_ref(), &liveness);
        let report = chain.run(set, &mut |stage| ctx.enter(PipelineState::verifying(stage)))?;

        for (stage, outcome) in report.stages() {
            info!("{:>9}: {}", stage.name(), outcome);
        }
        Ok(report)
    }

    fn extract(
        &self,
        ctx: &mut PipelineContext,
        archive: &Path,
        target: &Path,
    ) -> Result<ExtractionSummary> {
        ctx.enter(PipelineState::Extracting)?;
        extract::prepare_target(target)?;

        let liveness = ctx.liveness().clone();
        extract::extract(archive, target, &liveness, &mut |done, total| {
            let value = ctx.state().range().ratio(done, Some(total));
            ctx.set_progress(value);
            Ok(())
        })
    }

    fn bootstrap(
        &self,
        ctx: &mut PipelineContext,
        target: &Path,
        profile: InitProfile,
    ) -> Result<()> {
        ctx.enter(PipelineState::Bootstrapping)?;

        let config = ctx.config();
        let bootstrap = Bootstrap::new(target, profile)
            .with_encrypted_root(config.encrypted_root)
            .with_host_files(&config.resolv_conf, &config.binhost_conf)
            .with_repository_pruning(config.prune_repository_metadata);
        bootstrap.prepare_tree()?;

        let liveness = ctx.liveness().clone();
        // Dropping the session on any early return tears the mounts down
        let session = MountSession::establish(self.mounter.clone(), target, &liveness)?;

        bootstrap.run(self.runner.as_ref(), &liveness, &mut |index, count| {
            ctx.liveness().assert_parent_alive()?;
            ctx.advance_within(index as f64 / count as f64);
            Ok(())
        })?;

        ctx.enter(PipelineState::CleaningUp)?;
        bootstrap.clean_caches();
        session.release();
        Ok(())
    }
}
