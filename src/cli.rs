//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use segfetch_core::config::MAX_CONCURRENCY_LIMIT;

/// Segmented, resumable HTTP downloads.
///
/// Downloads are queued with `add` and fetched by `run`; progress is kept in a
/// local database so an interrupted `run` resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "segfetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/segfetch/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State database (default: <destination>/.segfetch.db)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory that receives finished files
    #[arg(short = 'd', long, global = true)]
    pub destination: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Queue a download
    Add {
        /// Source URL (http or https)
        url: String,

        /// File name to save as (default: derived from the URL)
        #[arg(long)]
        name: Option<String>,

        /// Admission priority; higher runs first
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i64,

        /// Expected SHA-256 of the complete file
        #[arg(long)]
        sha256: Option<String>,

        /// Expected size in bytes
        #[arg(long)]
        expected_size: Option<u64>,
    },

    /// Download everything queued, then exit
    Run {
        /// Maximum concurrent downloads
        #[arg(
            short = 'j',
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_CONCURRENCY_LIMIT))
        )]
        concurrency: Option<u32>,

        /// Maximum segments per download
        #[arg(
            short = 's',
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_CONCURRENCY_LIMIT))
        )]
        segments: Option<u32>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// List downloads
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Pause a download
    Pause {
        /// Download id
        id: i64,
    },

    /// Resume a paused download
    Resume {
        /// Download id
        id: i64,
    },

    /// Cancel a download and delete its partial files
    Cancel {
        /// Download id
        id: i64,
    },

    /// Queue a failed download again
    Retry {
        /// Download id
        id: i64,
    },

    /// Delete a download record (finished files are kept)
    Remove {
        /// Download id
        id: i64,
    },
}
