// SPDX-License-Identifier: Apache-2.0
mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = muxgate_config::load(cli.config.as_deref())?;
            muxgate_gateway::run(config).await
        }
        Commands::ShowConfig => {
            let config = muxgate_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
