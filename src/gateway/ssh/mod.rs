//! SSH transport: connection management, shell multiplexing and port
//! forwarding.
//!
//! - `client`: connection establishment and authentication
//! - `connection`: the per-client `RemoteConnection` state machine
//! - `shell`: PTY shell channels and their event plumbing
//! - `forward`: local TCP listeners bridged over `direct-tcpip`

pub(crate) mod client;
pub mod connection;
pub(crate) mod forward;
pub mod shell;

pub use connection::RemoteConnection;
pub use shell::{ShellEvent, ShellEventSender};
