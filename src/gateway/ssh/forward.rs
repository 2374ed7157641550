//! Local port forwarding over a remote connection.
//!
//! A forward is one local TCP listener. Every accepted connection opens its
//! own `direct-tcpip` channel (RFC 4254) to the remote destination and
//! bridges bytes in both directions until either side closes. Bridges are
//! independent of each other and of the listener: stopping a forward only
//! cancels the accept loop, and established bridges drain on their own,
//! matching OS listener-close semantics.

use std::sync::Arc;

use russh::client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::gateway::ssh::client::GatewayClientHandler;

/// State for one active forward tracked in the connection's forward map.
pub(crate) struct ForwardHandle {
    /// Cancels the accept loop, which drops the listener and unbinds the port.
    pub(crate) cancel: CancellationToken,
}

/// Run the accept loop for a bound forward listener.
///
/// Each accepted connection gets its own bridge task; an accept error or
/// cancellation ends the loop and drops the listener.
pub(crate) async fn run_forward_listener(
    listener: TcpListener,
    handle: Arc<client::Handle<GatewayClientHandler>>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    debug!(
        "port forward active on {:?} -> {}:{}",
        listener.local_addr(),
        remote_host,
        remote_port
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("port forward listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((local_stream, client_addr)) => {
                    debug!("new connection from {} to forwarded port", client_addr);

                    let handle = handle.clone();
                    let remote_host = remote_host.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            bridge_forwarded_connection(handle, local_stream, &remote_host, remote_port)
                                .await
                        {
                            debug!("port forward connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("error accepting forwarded connection: {}", e);
                    break;
                }
            }
        }
    }
}

/// Bridge one accepted local connection to the remote destination.
///
/// Opens a fresh `direct-tcpip` channel for this connection and copies
/// bytes both ways until either end closes.
async fn bridge_forwarded_connection(
    handle: Arc<client::Handle<GatewayClientHandler>>,
    local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), String> {
    let channel = handle
        .channel_open_direct_tcpip(
            remote_host,
            remote_port as u32,
            "127.0.0.1",
            0, // Local originator port (not significant for direct-tcpip)
        )
        .await
        .map_err(|e| format!("failed to open direct-tcpip channel: {}", e))?;

    let channel_stream = channel.into_stream();
    bridge_streams(local_stream, channel_stream).await;

    debug!("port forward connection closed");
    Ok(())
}

/// Copy bytes between two streams until either direction finishes.
pub(crate) async fn bridge_streams<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
    let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

    tokio::select! {
        result = a_to_b => {
            if let Err(e) = result {
                debug!("local to remote copy ended: {}", e);
            }
        }
        result = b_to_a => {
            if let Err(e) = result {
                debug!("remote to local copy ended: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_moves_bytes_both_directions() {
        let (client_a, bridged_a) = tokio::io::duplex(1024);
        let (client_b, bridged_b) = tokio::io::duplex(1024);

        let bridge = tokio::spawn(bridge_streams(bridged_a, bridged_b));

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        a_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_write.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side ends the bridge
        drop(a_write);
        drop(a_read);
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_terminates_when_one_side_closes() {
        let (client_a, bridged_a) = tokio::io::duplex(64);
        let (client_b, bridged_b) = tokio::io::duplex(64);

        let bridge = tokio::spawn(bridge_streams(bridged_a, bridged_b));

        drop(client_b);
        // The a-side can still be open; the bridge must finish regardless
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), bridge).await;
        assert!(result.is_ok());
        drop(client_a);
    }

    #[tokio::test]
    async fn test_listener_cancellation_unbinds_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        // No SSH handle is needed to exercise listener shutdown: cancel
        // fires before any connection is accepted.
        let cancel_clone = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel_clone.cancelled() => {}
                _ = listener.accept() => {}
            }
        });

        cancel.cancel();
        task.await.unwrap();

        // Port must be bindable again after the listener dropped
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
