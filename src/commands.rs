// src/commands.rs
//! Command handlers for the stage3-bootstrap CLI

use crate::cli::{ConfigArgs, ProgressMode};
use anyhow::{Context, Result};
use stage3_bootstrap::config::{HostConfig, PipelineConfig};
use stage3_bootstrap::liveness::Liveness;
use stage3_bootstrap::pipeline::{Pipeline, PipelineContext, RunOutcome};
use stage3_bootstrap::progress::{
    CliProgress, JsonProgress, LogProgress, ProgressSink, SilentProgress,
};
use stage3_bootstrap::source::ArtifactKind;
use std::sync::Arc;
use tracing::info;

/// Load the host file (if any) and apply command-line overrides
fn load_config(args: &ConfigArgs) -> Result<PipelineConfig> {
    let mut host = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => HostConfig::default(),
    };

    if let Some(url) = &args.url {
        host.final_download_url = Some(url.clone());
    }
    if let Some(archive) = &args.archive {
        host.stage_name_tar = Some(archive.clone());
    }
    if let Some(target) = &args.target {
        host.pipeline.extraction_dir = target.clone();
    }
    if args.live {
        host.gentoo_livecd = Some("yes".to_string());
    }

    Ok(host.resolve()?)
}

fn progress_sink(mode: ProgressMode) -> Arc<dyn ProgressSink> {
    match mode {
        ProgressMode::Cli => Arc::new(CliProgress::new()),
        ProgressMode::Json => Arc::new(JsonProgress::stdout()),
        ProgressMode::Log => Arc::new(LogProgress::new()),
        ProgressMode::Silent => Arc::new(SilentProgress),
    }
}

/// Run the full pipeline
pub fn cmd_run(args: &ConfigArgs, mode: ProgressMode) -> Result<()> {
    let config = load_config(args)?;
    let pipeline = Pipeline::system(&config).context("Failed to set up pipeline")?;
    let mut ctx = PipelineContext::new(config, Liveness::system(), progress_sink(mode));

    let outcome = pipeline.run(&mut ctx)?;
    if mode == ProgressMode::Json {
        return Ok(());
    }

    match outcome {
        RunOutcome::Installed {
            report,
            extraction,
            profile,
        } => {
            println!("Stage3 installed into {}", ctx.config().target.display());
            for (stage, outcome) in report.stages() {
                println!("  {:<9} {}", stage.name(), outcome);
            }
            println!(
                "  {} members extracted ({} already present)",
                extraction.members, extraction.collisions
            );
            println!("  init profile: {}", profile);
        }
        RunOutcome::LiveBound { source, target } => {
            println!("Live root {} bound onto {}", source.display(), target.display());
        }
    }
    Ok(())
}

/// Download and verify only
pub fn cmd_verify(args: &ConfigArgs, mode: ProgressMode) -> Result<()> {
    let config = load_config(args)?;
    if config.live {
        anyhow::bail!("Nothing to verify in live mode");
    }
    let pipeline = Pipeline::system(&config).context("Failed to set up pipeline")?;
    let mut ctx = PipelineContext::new(config, Liveness::system(), progress_sink(mode));

    let report = pipeline.verify_only(&mut ctx)?;
    if mode != ProgressMode::Json {
        let name = ctx.config().source()?.archive_name().to_string();
        println!("{} is trusted", name);
        for (stage, outcome) in report.stages() {
            println!("  {:<9} {}", stage.name(), outcome);
        }
    }
    Ok(())
}

/// Print the URLs a run would download
pub fn cmd_urls(args: &ConfigArgs) -> Result<()> {
    let config = load_config(args)?;
    let source = config.source().context("No archive configured")?;
    info!("Artifacts for {}", source.archive_name());

    for &kind in ArtifactKind::all() {
        let required = if kind.is_mandatory() {
            "required"
        } else {
            "optional"
        };
        println!("{:<9} {:<8} {}", kind.name(), required, source.url_for(kind));
    }
    Ok(())
}
