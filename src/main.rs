//! trelay - Reverse TCP tunnel relay.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trelay::{run_client, run_server, BuildInfo, Cli, Command};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Server(args) => {
            tracing::debug!(?args, "server arguments");

            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_server(&args)) {
                tracing::error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        Command::Client(args) => {
            tracing::debug!(?args, "client arguments");

            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = runtime.block_on(run_client(&args)) {
                tracing::error!(error = %e, "client error");
                std::process::exit(1);
            }
        }
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
        }
    }
}
