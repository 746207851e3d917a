use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const DEFAULT_CONFIG_PATH: &str = "blobkit.toml";

#[derive(Parser)]
#[command(name = "blobkit", about = "Inspect and verify blob storage backends")]
pub struct Cli {
    /// Config file with a [backend] table and optional [retry] table
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, conflicts_with = "token")]
    pub config: PathBuf,
    /// Connection token printed by `blobkit info --show-token`
    #[arg(long)]
    pub token: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List blobs
    Ls {
        /// Only blobs whose id starts with this
        #[arg(default_value = "")]
        prefix: String,
        /// Show length and timestamp
        #[arg(long)]
        long: bool,
    },
    /// Read a blob, or part of it
    Get {
        id: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read; to the end when omitted
        #[arg(long)]
        length: Option<u64>,
        /// Write here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Upload a file as a blob
    Put { id: String, file: PathBuf },
    /// Delete a blob
    Rm { id: String },
    /// Describe the configured backend
    Info {
        /// Also print the connection token (contains credentials)
        #[arg(long)]
        show_token: bool,
    },
    /// Run the conformance suite under a throwaway prefix
    Verify,
}
