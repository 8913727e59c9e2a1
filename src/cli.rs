//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Curate want-to-read lists into a personal e-book library.
///
/// Bookflow watches an external want-to-read list, locates each book in a
/// remote e-book repository, downloads it under the daily quota, and
/// ingests the file into a personal library.
#[derive(Parser, Debug)]
#[command(name = "bookflow")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Force single-task concurrency for debugging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Feed the list once, drain the pipeline, and exit
    RunOnce,
    /// Run continuously with periodic feeds
    Daemon {
        /// Seconds between feed passes
        #[arg(long, default_value_t = 3600)]
        feed_interval_secs: u64,
    },
    /// Dump the status histogram and scheduler statistics
    Status,
    /// Run a reconciliation pass and garbage-collect task rows
    Cleanup,
}
