//! Command line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ccbridge", version, about = "Gateway between interactive clients and a local Agent CLI")]
pub struct Cli {
    /// Path to a configuration file (defaults to ./ccbridge.{toml,yaml,json}).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the gateway server (the default).
    Serve {
        /// Bind host, overriding the configuration.
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overriding the configuration.
        #[arg(long)]
        port: Option<u16>,

        /// Bearer token required from clients.
        #[arg(long)]
        token: Option<String>,

        /// Root directory session working directories must live under.
        #[arg(long)]
        safe_root: Option<PathBuf>,
    },

    /// Locate the Agent CLI and verify it responds.
    CheckAgent,
}

impl Cli {
    /// Log filter directive derived from the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
