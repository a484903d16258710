//! CLI definitions for trelay.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};

/// Default registration port on the relay server.
pub const DEFAULT_REGISTRATION_PORT: u16 = 5678;

/// Default lower bound of the assignable public port range (inclusive).
pub const DEFAULT_MIN_PORT: u16 = 10000;

/// Default upper bound of the assignable public port range (inclusive).
pub const DEFAULT_MAX_PORT: u16 = 10050;

/// Default local service port a tunnel client forwards to.
pub const DEFAULT_LOCAL_PORT: u16 = 3000;

/// Keepalive ping interval in seconds.
pub const PING_INTERVAL_SECS: u64 = 30;

/// Reverse TCP tunnel relay: expose a private local service through a public port.
#[derive(Debug, Parser)]
#[command(name = "trelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the public-facing relay server
    Server(ServerArgs),

    /// Start the tunnel client next to a local service
    Client(ClientArgs),

    /// Show version information
    Version,
}

/// Arguments for the server subcommand.
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// Port for client registrations
    #[arg(long, default_value_t = DEFAULT_REGISTRATION_PORT)]
    pub port: u16,

    /// Minimum port in the range of assignable public ports
    #[arg(long, default_value_t = DEFAULT_MIN_PORT)]
    pub min_port: u16,

    /// Maximum port in the range of assignable public ports
    #[arg(long, default_value_t = DEFAULT_MAX_PORT)]
    pub max_port: u16,
}

/// Arguments for the client subcommand.
#[derive(Debug, Parser)]
pub struct ClientArgs {
    /// Relay server hostname or IP
    #[arg(long, default_value = "localhost")]
    pub relay: String,

    /// Relay server registration port
    #[arg(long, default_value_t = DEFAULT_REGISTRATION_PORT)]
    pub relay_port: u16,

    /// Local service hostname
    #[arg(long, default_value = "localhost")]
    pub local_host: String,

    /// Local service port
    #[arg(long, default_value_t = DEFAULT_LOCAL_PORT)]
    pub local_port: u16,
}

/// Build information for the version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("TRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("TRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "trelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
