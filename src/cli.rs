use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tilde-where",
    version,
    about = "Record the approximate locations of opted-in users logged in to this host",
    after_help = "Users opt in by creating a `.here` or `.somewhere` file in their home directory."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Read configuration from this file instead of the default location.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// ipstack access key (overrides the config file).
    #[arg(short = 'k', long, value_name = "KEY", global = true)]
    pub api_key: Option<String>,

    /// Location cache to read and replace (overrides the config file).
    #[arg(long, value_name = "FILE", global = true)]
    pub cache: Option<PathBuf>,

    /// Directory holding user home directories (overrides the config file).
    #[arg(long, value_name = "DIR", global = true)]
    pub home_root: Option<PathBuf>,

    /// Read a captured `who --ips` listing instead of running `who`.
    #[arg(short = 'p', long, value_name = "FILE")]
    pub sessions_file: Option<PathBuf>,

    /// Log every lookup, not just failures.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the configured paths and a summary of the location cache.
    Status,
    /// Check that lookups can run on this host.
    Doctor,
}
