//! trelay - Reverse TCP tunnel relay.
//!
//! This crate lets a private host expose a locally-bound TCP service through
//! a publicly reachable port. The relay server leases public ports to tunnel
//! clients and multiplexes external user connections over each client's
//! single JSON-framed control connection.

pub mod cli;
pub mod client;
pub mod common;
pub mod error;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod session;

pub use cli::{BuildInfo, Cli, ClientArgs, Command, ServerArgs};
pub use client::{run_client, TunnelClient};
pub use common::{shutdown_signal, MessageReader, MessageWriter, READ_BUFFER_SIZE};
pub use error::{Error, Result};
pub use ports::PortPool;
pub use protocol::{ControlMessage, RegistrationRequest, RegistrationResponse};
pub use server::{run_server, RelayServer};
pub use session::{ClientSession, ServerState};
