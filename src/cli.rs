// SPDX-License-Identifier: Apache-2.0
//! Command-line surface for the muxgate binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "muxgate", version, about = "Control-plane gateway multiplexing agent workers onto client requests")]
pub struct Cli {
    /// Path to an explicit gateway.yaml, overriding the search-path layers.
    #[arg(long, global = true, env = "MUXGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). Default: info.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway until Ctrl+C or SIGTERM (the default with no subcommand).
    Serve,
    /// Print the fully-merged configuration as YAML and exit.
    ShowConfig,
}
