//! metasync CLI
//!
//! Operator tools for the metasync engine.
//!
//! # Commands
//!
//! - `inspect` - Dump a checkpoint record
//! - `decode-token` - Decode a change row version token
//! - `mapping` - Print the canonical field mapping for a sink version
//! - `validate-config` - Validate sync settings

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// metasync command-line tools.
#[derive(Parser)]
#[command(name = "metasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the checkpoint record of an account or container
    Inspect {
        /// Directory holding checkpoint records
        #[arg(long)]
        status_dir: PathBuf,

        /// Account name
        #[arg(short, long)]
        account: String,

        /// Container name (omit for per-account records)
        #[arg(short, long)]
        container: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a version token
    DecodeToken {
        /// Token as stored in the change feed, such as 1528323859.00000+0+64
        token: String,

        /// Treat the row as a delete
        #[arg(short, long)]
        deleted: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the canonical field mapping for a search cluster version
    Mapping {
        /// Version reported by the cluster
        #[arg(long = "version", value_name = "X.Y.Z")]
        sink_version: String,
    },

    /// Validate sync settings and print the resolved destination
    ValidateConfig {
        /// JSON settings of one sync mapping
        settings: PathBuf,

        /// Directory holding checkpoint records
        #[arg(long)]
        status_dir: Option<PathBuf>,

        /// Keep one checkpoint record per account
        #[arg(long)]
        per_account: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            status_dir,
            account,
            container,
            format,
        } => {
            commands::inspect::run(&status_dir, &account, container.as_deref(), &format)?;
        }
        Commands::DecodeToken {
            token,
            deleted,
            format,
        } => {
            commands::decode_token::run(&token, deleted, &format)?;
        }
        Commands::Mapping { sink_version } => {
            commands::mapping::run(&sink_version)?;
        }
        Commands::ValidateConfig {
            settings,
            status_dir,
            per_account,
            format,
        } => {
            commands::validate_config::run(&settings, status_dir.as_deref(), per_account, &format)?;
        }
    }

    Ok(())
}
