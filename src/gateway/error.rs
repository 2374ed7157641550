//! Gateway error taxonomy.
//!
//! Failures are classified by how they surface to the client:
//!
//! - Precondition violations (not connected, duplicate session id,
//!   duplicate forward port) fail the single operation that hit them.
//! - Remote I/O failures carry the underlying reason string and leave
//!   the connection flag reflecting the true state.
//! - None of these are fatal to the client's transport connection;
//!   handlers convert every variant into an error envelope.

use thiserror::Error;

/// Errors produced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Operation requires an established SSH connection.
    #[error("not connected to a remote host")]
    NotConnected,

    /// A connect was issued while a connection is already established.
    #[error("already connected to a remote host")]
    AlreadyConnected,

    /// Shell session identifier is already in use on this connection.
    #[error("shell session '{0}' already exists")]
    DuplicateShell(String),

    /// Local port already has an active forward on this connection.
    #[error("local port {0} is already forwarded")]
    DuplicateForward(u16),

    /// Connection, authentication or channel failure from the remote side.
    #[error("remote error: {0}")]
    Remote(String),

    /// Local I/O failure (bind, spawn, read).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Reason string for an error envelope.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Convenience alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            GatewayError::NotConnected.to_string(),
            "not connected to a remote host"
        );
        assert_eq!(
            GatewayError::DuplicateShell("build".to_string()).to_string(),
            "shell session 'build' already exists"
        );
        assert_eq!(
            GatewayError::DuplicateForward(8080).to_string(),
            "local port 8080 is already forwarded"
        );
    }

    #[test]
    fn test_remote_carries_reason() {
        let err = GatewayError::Remote("authentication failed".to_string());
        assert!(err.reason().contains("authentication failed"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(_)));
        assert!(err.reason().contains("port busy"));
    }
}
