//! One authenticated SSH connection multiplexing shells and port forwards.
//!
//! A `RemoteConnection` is exclusively owned by the single client identity
//! that created it through the registry; the server never shares one
//! instance between clients, so all internal state sits behind one async
//! mutex with no cross-client contention.
//!
//! Lifecycle: created unconnected, populated by [`RemoteConnection::connect`],
//! mutated by shell/forward operations while connected, and fully torn down
//! by [`RemoteConnection::disconnect`], which is idempotent and safe to
//! call from any state. Once disconnected, every derived stream and
//! listener is already gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use russh::{Disconnect, client};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::ssh::client::{GatewayClientHandler, connect_and_authenticate};
use crate::gateway::ssh::forward::{ForwardHandle, run_forward_listener};
use crate::gateway::ssh::shell::{
    ShellEventSender, ShellHandle, ShellWriter, open_shell_channel, run_shell_reader,
};

/// Metadata about the authenticated peer, kept for status messages and logs.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connected_at: String,
}

#[derive(Default)]
struct ConnState {
    handle: Option<Arc<client::Handle<GatewayClientHandler>>>,
    /// True while a connect attempt is in flight; a second concurrent
    /// connect on the same instance is rejected rather than raced.
    connecting: bool,
    peer: Option<PeerInfo>,
    shells: HashMap<String, ShellHandle>,
    forwards: HashMap<u16, ForwardHandle>,
    shell_epoch: u64,
}

/// One remote host session owning named shells and local port forwards.
pub struct RemoteConnection {
    state: Arc<Mutex<ConnState>>,
}

impl Default for RemoteConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteConnection {
    /// Create an unconnected instance.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnState::default())),
        }
    }

    /// Open and authenticate the underlying SSH session.
    ///
    /// Fails if already connected or while another connect is in flight.
    /// The attempt is bounded by `timeout` and never retried; on failure
    /// the instance stays unconnected and the reason carries the cause.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
        private_key: Option<&str>,
        timeout: Duration,
    ) -> GatewayResult<()> {
        {
            let mut st = self.state.lock().await;
            if st.handle.is_some() {
                return Err(GatewayError::AlreadyConnected);
            }
            if st.connecting {
                return Err(GatewayError::Remote(
                    "a connect attempt is already in progress".to_string(),
                ));
            }
            st.connecting = true;
        }

        let result =
            connect_and_authenticate(host, port, username, password, private_key, timeout).await;

        let mut st = self.state.lock().await;
        st.connecting = false;
        match result {
            Ok(handle) => {
                info!("ssh connection established to {}@{}:{}", username, host, port);
                st.handle = Some(Arc::new(handle));
                st.peer = Some(PeerInfo {
                    host: host.to_string(),
                    port,
                    username: username.to_string(),
                    connected_at: chrono::Utc::now().to_rfc3339(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("ssh connection to {}@{}:{} failed: {}", username, host, port, e);
                Err(e)
            }
        }
    }

    /// Whether an authenticated session is currently held.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.handle.is_some()
    }

    /// Peer metadata, if connected.
    pub async fn peer(&self) -> Option<PeerInfo> {
        self.state.lock().await.peer.clone()
    }

    /// Start an interactive PTY shell registered under `session_id`.
    ///
    /// Output and the single close notification flow through `events`.
    /// Fails when not connected, when the id is already in use, or when
    /// the remote side refuses the channel.
    pub async fn start_shell(
        &self,
        session_id: &str,
        cols: u32,
        rows: u32,
        events: ShellEventSender,
    ) -> GatewayResult<()> {
        let handle = {
            let st = self.state.lock().await;
            if st.shells.contains_key(session_id) {
                return Err(GatewayError::DuplicateShell(session_id.to_string()));
            }
            st.handle.clone().ok_or(GatewayError::NotConnected)?
        };

        let channel = open_shell_channel(&handle, cols, rows).await?;
        let (read_half, write_half) = channel.split();
        let cancel = CancellationToken::new();

        let epoch = {
            let mut st = self.state.lock().await;
            // The connection may have been torn down, or the id taken,
            // while the channel opened.
            if st.handle.is_none() {
                let _ = ShellWriter::new(write_half).close().await;
                return Err(GatewayError::NotConnected);
            }
            if st.shells.contains_key(session_id) {
                let _ = ShellWriter::new(write_half).close().await;
                return Err(GatewayError::DuplicateShell(session_id.to_string()));
            }
            st.shell_epoch += 1;
            let epoch = st.shell_epoch;
            st.shells.insert(
                session_id.to_string(),
                ShellHandle {
                    writer: ShellWriter::new(write_half),
                    cancel: cancel.clone(),
                    epoch,
                },
            );
            epoch
        };

        info!("shell '{}' started ({}x{})", session_id, cols, rows);

        let state = self.state.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            run_shell_reader(sid.clone(), read_half, cancel, events).await;
            let mut st = state.lock().await;
            // Only reap our own entry; the id may have been reused by a
            // newer shell after an explicit close.
            if st.shells.get(&sid).map(|s| s.epoch) == Some(epoch) {
                st.shells.remove(&sid);
            }
        });

        Ok(())
    }

    /// Write raw bytes to the named shell's input.
    ///
    /// Returns false without error when the session is unknown or the
    /// stream rejects the write, so callers can report silently.
    pub async fn write_to_shell(&self, session_id: &str, data: &[u8]) -> bool {
        let st = self.state.lock().await;
        match st.shells.get(session_id) {
            Some(shell) => match shell.writer.write(data).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("write to shell '{}' failed: {}", session_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Update the named shell's PTY window size. No-op on unknown ids.
    pub async fn resize_shell(&self, session_id: &str, cols: u32, rows: u32) -> bool {
        let st = self.state.lock().await;
        match st.shells.get(session_id) {
            Some(shell) => match shell.writer.resize(cols, rows).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("resize of shell '{}' failed: {}", session_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Close the named shell and drop it from the map.
    ///
    /// Returns whether a session existed to close. The close notification
    /// itself is delivered through the shell's event channel.
    pub async fn close_shell(&self, session_id: &str) -> bool {
        let shell = self.state.lock().await.shells.remove(session_id);
        match shell {
            Some(shell) => {
                let _ = shell.writer.close().await;
                shell.cancel.cancel();
                info!("shell '{}' closed", session_id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of currently open shell identifiers.
    pub async fn active_shells(&self) -> Vec<String> {
        let st = self.state.lock().await;
        let mut ids: Vec<String> = st.shells.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bind a local listener forwarding accepted connections to
    /// `remote_host:remote_port` through this connection.
    ///
    /// Fails on a duplicate local port, when not connected, or when the
    /// bind itself fails; no partial state is retained on any failure path.
    pub async fn setup_port_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> GatewayResult<()> {
        let handle = {
            let st = self.state.lock().await;
            if st.forwards.contains_key(&local_port) {
                return Err(GatewayError::DuplicateForward(local_port));
            }
            st.handle.clone().ok_or(GatewayError::NotConnected)?
        };

        let listener = TcpListener::bind(("127.0.0.1", local_port)).await.map_err(|e| {
            GatewayError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to bind local port {}: {}", local_port, e),
            ))
        })?;

        let cancel = CancellationToken::new();
        {
            let mut st = self.state.lock().await;
            if st.handle.is_none() {
                return Err(GatewayError::NotConnected);
            }
            if st.forwards.contains_key(&local_port) {
                return Err(GatewayError::DuplicateForward(local_port));
            }
            st.forwards.insert(
                local_port,
                ForwardHandle {
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            "port forward active: 127.0.0.1:{} -> {}:{}",
            local_port, remote_host, remote_port
        );

        tokio::spawn(run_forward_listener(
            listener,
            handle,
            remote_host.to_string(),
            remote_port,
            cancel,
        ));

        Ok(())
    }

    /// Stop the forward on `local_port` if one exists.
    ///
    /// Cancels the accept loop (unbinding the port); already-established
    /// bridges drain on their own. Idempotent.
    pub async fn stop_port_forward(&self, local_port: u16) -> bool {
        match self.state.lock().await.forwards.remove(&local_port) {
            Some(forward) => {
                forward.cancel.cancel();
                info!("port forward on 127.0.0.1:{} stopped", local_port);
                true
            }
            None => false,
        }
    }

    /// Idempotent full teardown.
    ///
    /// Closes every shell (each delivers its close notification through
    /// its event channel), cancels every forward listener, then terminates
    /// the underlying session. Safe to call repeatedly and when never
    /// connected.
    pub async fn disconnect(&self) {
        let (shells, forwards, handle) = {
            let mut st = self.state.lock().await;
            st.connecting = false;
            st.peer = None;
            (
                std::mem::take(&mut st.shells),
                std::mem::take(&mut st.forwards),
                st.handle.take(),
            )
        };

        for (session_id, shell) in shells {
            shell.cancel.cancel();
            if shell.writer.close().await.is_err() {
                debug!("shell '{}' channel already gone at disconnect", session_id);
            }
        }

        for (local_port, forward) in forwards {
            forward.cancel.cancel();
            debug!("port forward on 127.0.0.1:{} stopped at disconnect", local_port);
        }

        if let Some(handle) = handle {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "english")
                .await;
            info!("ssh connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn events() -> ShellEventSender {
        mpsc::unbounded_channel().0
    }

    mod unconnected_state {
        use super::*;

        #[tokio::test]
        async fn test_new_connection_is_unconnected() {
            let conn = RemoteConnection::new();
            assert!(!conn.is_connected().await);
            assert!(conn.peer().await.is_none());
            assert!(conn.active_shells().await.is_empty());
        }

        #[tokio::test]
        async fn test_start_shell_requires_connection() {
            let conn = RemoteConnection::new();
            let result = conn.start_shell("s1", 80, 24, events()).await;
            assert!(matches!(result, Err(GatewayError::NotConnected)));
            assert!(conn.active_shells().await.is_empty());
        }

        #[tokio::test]
        async fn test_port_forward_requires_connection() {
            let conn = RemoteConnection::new();
            let result = conn.setup_port_forward(9000, "127.0.0.1", 80).await;
            assert!(matches!(result, Err(GatewayError::NotConnected)));
        }
    }

    mod unknown_session_ids {
        use super::*;

        #[tokio::test]
        async fn test_write_to_unknown_shell_returns_false() {
            let conn = RemoteConnection::new();
            assert!(!conn.write_to_shell("ghost", b"ls\n").await);
        }

        #[tokio::test]
        async fn test_resize_unknown_shell_returns_false() {
            let conn = RemoteConnection::new();
            assert!(!conn.resize_shell("ghost", 100, 30).await);
        }

        #[tokio::test]
        async fn test_close_unknown_shell_returns_false() {
            let conn = RemoteConnection::new();
            assert!(!conn.close_shell("ghost").await);
        }

        #[tokio::test]
        async fn test_stop_unknown_forward_returns_false() {
            let conn = RemoteConnection::new();
            assert!(!conn.stop_port_forward(9000).await);
        }
    }

    mod connect_guards {
        use super::*;

        #[tokio::test]
        async fn test_concurrent_connect_rejected() {
            let conn = RemoteConnection::new();
            conn.state.lock().await.connecting = true;

            let result = conn
                .connect("127.0.0.1", 22, "dev", Some("pw"), None, Duration::from_secs(1))
                .await;

            let reason = result.err().map(|e| e.reason()).unwrap_or_default();
            assert!(reason.contains("already in progress"));
        }

        #[tokio::test]
        async fn test_failed_connect_leaves_unconnected() {
            let conn = RemoteConnection::new();
            // Nothing listens on port 1; fails fast without a remote host
            let result = conn
                .connect(
                    "127.0.0.1",
                    1,
                    "dev",
                    Some("pw"),
                    None,
                    Duration::from_millis(500),
                )
                .await;

            assert!(result.is_err());
            assert!(!conn.is_connected().await);
            assert!(!conn.state.lock().await.connecting);
        }
    }

    mod forward_guards {
        use super::*;

        #[tokio::test]
        async fn test_duplicate_local_port_rejected_and_existing_untouched() {
            let conn = RemoteConnection::new();
            let existing = CancellationToken::new();
            conn.state.lock().await.forwards.insert(
                9000,
                ForwardHandle {
                    cancel: existing.clone(),
                },
            );

            let result = conn.setup_port_forward(9000, "127.0.0.1", 80).await;
            assert!(matches!(result, Err(GatewayError::DuplicateForward(9000))));

            // The existing forward must be untouched
            assert!(!existing.is_cancelled());
            assert!(conn.state.lock().await.forwards.contains_key(&9000));
        }

        #[tokio::test]
        async fn test_stop_forward_cancels_listener() {
            let conn = RemoteConnection::new();
            let cancel = CancellationToken::new();
            conn.state.lock().await.forwards.insert(
                9001,
                ForwardHandle {
                    cancel: cancel.clone(),
                },
            );

            assert!(conn.stop_port_forward(9001).await);
            assert!(cancel.is_cancelled());
            assert!(!conn.stop_port_forward(9001).await);
        }
    }

    mod teardown {
        use super::*;

        #[tokio::test]
        async fn test_disconnect_is_idempotent_when_never_connected() {
            let conn = RemoteConnection::new();
            conn.disconnect().await;
            conn.disconnect().await;
            assert!(!conn.is_connected().await);
        }

        #[tokio::test]
        async fn test_disconnect_cancels_forwards() {
            let conn = RemoteConnection::new();
            let cancel = CancellationToken::new();
            conn.state.lock().await.forwards.insert(
                9002,
                ForwardHandle {
                    cancel: cancel.clone(),
                },
            );

            conn.disconnect().await;

            assert!(cancel.is_cancelled());
            assert!(conn.state.lock().await.forwards.is_empty());
        }

        #[tokio::test]
        async fn test_disconnect_clears_peer() {
            let conn = RemoteConnection::new();
            conn.state.lock().await.peer = Some(PeerInfo {
                host: "h".to_string(),
                port: 22,
                username: "u".to_string(),
                connected_at: "now".to_string(),
            });

            conn.disconnect().await;
            assert!(conn.peer().await.is_none());
        }
    }
}
