// src/cli.rs
//! CLI definitions for stage3-bootstrap
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stage3-bootstrap")]
#[command(author = "stage3-bootstrap Contributors")]
#[command(version)]
#[command(about = "Fetch, verify, extract and bootstrap a Gentoo stage3", long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the whole pipeline: download, verify, extract, bootstrap
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// How progress is reported
        #[arg(long, value_enum, default_value_t = ProgressMode::Cli)]
        progress: ProgressMode,
    },

    /// Download and verify the archive without touching the target
    Verify {
        #[command(flatten)]
        config: ConfigArgs,

        /// How progress is reported
        #[arg(long, value_enum, default_value_t = ProgressMode::Cli)]
        progress: ProgressMode,
    },

    /// Print the archive URL and the derived artifact URLs
    Urls {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Host configuration file plus per-key overrides
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Host global storage file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Archive URL (overrides FINAL_DOWNLOAD_URL)
    #[arg(long)]
    pub url: Option<String>,

    /// Archive file name (overrides STAGE_NAME_TAR)
    #[arg(long)]
    pub archive: Option<String>,

    /// Extraction directory (overrides [pipeline].extraction_dir)
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Bind the live root image instead of downloading
    #[arg(long)]
    pub live: bool,
}

/// Progress output selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
    /// Terminal progress bar
    Cli,
    /// One JSON object per line on stdout
    Json,
    /// Log lines through tracing
    Log,
    /// No progress output
    Silent,
}
