//! Interactive shell sessions multiplexed inside a remote connection.
//!
//! Each shell is one PTY-backed russh channel. The channel is split after
//! the PTY and shell requests: the write half lives in the connection's
//! shell map for input/resize/close, and the read half is consumed by a
//! dedicated reader task that pumps output chunks into a [`ShellEvent`]
//! channel. The reader task is the single producer of the `Closed` event,
//! which makes the exactly-once close notification structural rather than
//! something callers have to coordinate.

use russh::{Channel, ChannelMsg, ChannelWriteHalf, client};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::ssh::client::GatewayClientHandler;

/// Events emitted by a shell session.
///
/// Output chunks for one session arrive in the order the remote side
/// produced them; there is no ordering guarantee across sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    /// A chunk of terminal output.
    Output { session_id: String, data: Vec<u8> },
    /// The shell's stream closed. Emitted exactly once per shell,
    /// whether closed locally, by the remote side, or by connection
    /// teardown.
    Closed { session_id: String },
}

/// Sender half of a connection's shell event channel.
pub type ShellEventSender = mpsc::UnboundedSender<ShellEvent>;

/// Write handle for sending input to a shell channel.
///
/// Wraps `russh::ChannelWriteHalf` so input, resize and close never contend
/// with the reader task for the channel.
pub(crate) struct ShellWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ShellWriter {
    pub(crate) fn new(write_half: ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    /// Send data (text, keystrokes, escape sequences) to the shell.
    pub(crate) async fn write(&self, data: &[u8]) -> Result<(), String> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| format!("failed to write to shell: {}", e))
    }

    /// Update the remote PTY's window size.
    pub(crate) async fn resize(&self, cols: u32, rows: u32) -> Result<(), String> {
        self.write_half
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| format!("failed to resize shell: {}", e))
    }

    /// Close the channel gracefully.
    pub(crate) async fn close(&self) -> Result<(), String> {
        self.write_half
            .close()
            .await
            .map_err(|e| format!("failed to close shell channel: {}", e))
    }
}

/// State for one open shell tracked in the connection's shell map.
///
/// Terminal dimensions live in the remote PTY; the gateway only relays
/// resize requests.
pub(crate) struct ShellHandle {
    pub(crate) writer: ShellWriter,
    /// Cancels the reader task; cancellation drives the close notification.
    pub(crate) cancel: CancellationToken,
    /// Distinguishes this shell from a later shell reusing the same id, so
    /// a finished reader never reaps its successor's map entry.
    pub(crate) epoch: u64,
}

/// Open a session channel and turn it into an interactive PTY shell.
pub(crate) async fn open_shell_channel(
    handle: &Arc<client::Handle<GatewayClientHandler>>,
    cols: u32,
    rows: u32,
) -> GatewayResult<Channel<client::Msg>> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| GatewayError::Remote(format!("failed to open shell channel: {}", e)))?;

    channel
        .request_pty(true, "xterm-256color", cols, rows, 0, 0, &[])
        .await
        .map_err(|e| GatewayError::Remote(format!("failed to allocate pty: {}", e)))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| GatewayError::Remote(format!("failed to start shell: {}", e)))?;

    Ok(channel)
}

/// Pump output from a shell's read half into the event channel.
///
/// Runs until the channel closes (either side) or the cancellation token
/// fires, then emits the single `Closed` event. The owning connection
/// wraps this in a task that reaps the shell-map entry afterwards.
pub(crate) async fn run_shell_reader(
    session_id: String,
    mut read_half: russh::ChannelReadHalf,
    cancel: CancellationToken,
    events: ShellEventSender,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("shell '{}' reader cancelled", session_id);
                break;
            }
            msg = read_half.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    let _ = events.send(ShellEvent::Output {
                        session_id: session_id.clone(),
                        data: data.to_vec(),
                    });
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    // PTY shells merge stderr into the terminal stream
                    let _ = events.send(ShellEvent::Output {
                        session_id: session_id.clone(),
                        data: data.to_vec(),
                    });
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                    debug!("shell '{}' closed by remote", session_id);
                    break;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("shell '{}' exited with status {}", session_id, exit_status);
                }
                Some(_) => {
                    // Ignore other message types
                }
                None => {
                    // Underlying connection is gone
                    debug!("shell '{}' channel terminated", session_id);
                    break;
                }
            }
        }
    }

    let _ = events.send(ShellEvent::Closed { session_id });
}

#[cfg(test)]
mod tests {
    use super::*;

    mod shell_events {
        use super::*;

        #[test]
        fn test_output_event_carries_bytes() {
            let event = ShellEvent::Output {
                session_id: "s1".to_string(),
                data: b"ls -la\r\n".to_vec(),
            };
            match event {
                ShellEvent::Output { session_id, data } => {
                    assert_eq!(session_id, "s1");
                    assert_eq!(data, b"ls -la\r\n");
                }
                ShellEvent::Closed { .. } => panic!("expected output event"),
            }
        }

        #[tokio::test]
        async fn test_event_channel_preserves_order() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            for i in 0..10u8 {
                tx.send(ShellEvent::Output {
                    session_id: "s1".to_string(),
                    data: vec![i],
                })
                .unwrap();
            }
            drop(tx);

            let mut seen = Vec::new();
            while let Some(ShellEvent::Output { data, .. }) = rx.recv().await {
                seen.push(data[0]);
            }
            assert_eq!(seen, (0..10).collect::<Vec<u8>>());
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_cancellation_token_state() {
            let token = CancellationToken::new();
            assert!(!token.is_cancelled());

            token.cancel();
            assert!(token.is_cancelled());
        }
    }
}
