//! Handler for the `ssh_` message family.
//!
//! Translates protocol messages into [`RemoteConnection`] calls and owns
//! the per-client pump that serializes shell events into outbound
//! envelopes. Every failure becomes a structured response; nothing here
//! can take down the client's transport connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gateway::protocol::{
    CloseShellRequest, Envelope, PortForwardRequest, ShellInputRequest, ShellResizeRequest,
    SshConnectRequest, StartShellRequest, StopPortForwardRequest,
};
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::router::{ClientContext, MessageHandler};
use crate::gateway::ssh::{ShellEvent, ShellEventSender};

/// Handler owning the `ssh_` prefix.
pub struct SshHandler {
    registry: Arc<ConnectionRegistry>,
    connect_timeout: Duration,
    /// Per-client shell event senders; the paired pump task turns events
    /// into `ssh_output` / `ssh_shell_closed` envelopes.
    event_channels: DashMap<String, ShellEventSender>,
}

impl SshHandler {
    pub fn new(registry: Arc<ConnectionRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connect_timeout,
            event_channels: DashMap::new(),
        }
    }

    /// Get or create the client's shell event channel and its pump task.
    ///
    /// One pump per client keeps all of that client's shell output ordered
    /// on its outbound stream; the pump ends when the last sender clone is
    /// dropped after cleanup.
    fn shell_events(&self, ctx: &ClientContext) -> ShellEventSender {
        self.event_channels
            .entry(ctx.client_id.clone())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<ShellEvent>();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            ShellEvent::Output { session_id, data } => {
                                ctx.send(Envelope::message(
                                    "ssh_output",
                                    json!({
                                        "sessionId": session_id,
                                        "output": String::from_utf8_lossy(&data),
                                    }),
                                ));
                            }
                            ShellEvent::Closed { session_id } => {
                                ctx.send(Envelope::message(
                                    "ssh_shell_closed",
                                    json!({ "sessionId": session_id, "success": true }),
                                ));
                            }
                        }
                    }
                    debug!("shell event pump stopped for client {}", ctx.client_id);
                });
                tx
            })
            .clone()
    }

    async fn handle_connect(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: SshConnectRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_connect_response", reason));
                return;
            }
        };

        let connection = self.registry.get(&ctx.client_id);
        let result = connection
            .connect(
                &request.host,
                request.port,
                &request.username,
                request.password.as_deref(),
                request.private_key.as_deref(),
                self.connect_timeout,
            )
            .await;

        match result {
            Ok(()) => {
                ctx.send(Envelope::message(
                    "ssh_connect_response",
                    json!({
                        "success": true,
                        "message": format!(
                            "connected to {}@{}:{}",
                            request.username, request.host, request.port
                        ),
                    }),
                ));
                ctx.send(Envelope::message(
                    "ssh_status",
                    json!({ "status": "connected" }),
                ));
            }
            Err(e) => {
                ctx.send(Envelope::message(
                    "ssh_connect_response",
                    json!({ "success": false, "message": e.reason() }),
                ));
                ctx.send(Envelope::message(
                    "ssh_status",
                    json!({ "status": "error", "message": e.reason() }),
                ));
            }
        }
    }

    async fn handle_start_shell(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: StartShellRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_shell_started", reason));
                return;
            }
        };

        let session_id = request.session_id();
        let (cols, rows) = request.dimensions();
        let events = self.shell_events(ctx);
        let connection = self.registry.get(&ctx.client_id);

        match connection.start_shell(&session_id, cols, rows, events).await {
            Ok(()) => {
                ctx.send(Envelope::message(
                    "ssh_shell_started",
                    json!({ "sessionId": session_id }),
                ));
            }
            Err(e) => {
                ctx.send(Envelope::failure(
                    "ssh_shell_started",
                    json!({ "sessionId": session_id, "success": false }),
                    e.reason(),
                ));
            }
        }
    }

    async fn handle_input(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: ShellInputRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_input_response", reason));
                return;
            }
        };

        let session_id = request
            .session_id
            .unwrap_or_else(|| crate::gateway::protocol::DEFAULT_SHELL_ID.to_string());
        let connection = self.registry.get(&ctx.client_id);
        if !connection
            .write_to_shell(&session_id, request.input.as_bytes())
            .await
        {
            debug!(
                "client {}: input to unknown shell '{}' ignored",
                ctx.client_id, session_id
            );
        }
    }

    async fn handle_resize(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: ShellResizeRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_resize_response", reason));
                return;
            }
        };

        let session_id = request
            .session_id
            .unwrap_or_else(|| crate::gateway::protocol::DEFAULT_SHELL_ID.to_string());
        let connection = self.registry.get(&ctx.client_id);
        if !connection
            .resize_shell(&session_id, request.cols, request.rows)
            .await
        {
            debug!(
                "client {}: resize of unknown shell '{}' ignored",
                ctx.client_id, session_id
            );
        }
    }

    async fn handle_close_shell(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: CloseShellRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_shell_closed", reason));
                return;
            }
        };

        let connection = self.registry.get(&ctx.client_id);
        if !connection.close_shell(&request.session_id).await {
            // Known shells announce their closure through the event pump;
            // only the unknown-id case needs a direct reply.
            ctx.send(Envelope::message(
                "ssh_shell_closed",
                json!({ "sessionId": request.session_id, "success": false }),
            ));
        }
    }

    async fn handle_list_shells(&self, ctx: &ClientContext) {
        let connection = self.registry.get(&ctx.client_id);
        let shells = connection.active_shells().await;
        ctx.send(Envelope::message(
            "ssh_list_shells_response",
            json!({ "shells": shells }),
        ));
    }

    async fn handle_disconnect(&self, ctx: &ClientContext) {
        self.registry.remove(&ctx.client_id).await;
        ctx.send(Envelope::message(
            "ssh_status",
            json!({ "status": "disconnected" }),
        ));
    }

    async fn handle_port_forward(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: PortForwardRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_port_forward_response", reason));
                return;
            }
        };

        let connection = self.registry.get(&ctx.client_id);
        match connection
            .setup_port_forward(request.local_port, &request.remote_host, request.remote_port)
            .await
        {
            Ok(()) => {
                ctx.send(Envelope::message(
                    "ssh_port_forward_response",
                    json!({ "success": true, "localPort": request.local_port }),
                ));
            }
            Err(e) => {
                ctx.send(Envelope::message(
                    "ssh_port_forward_response",
                    json!({
                        "success": false,
                        "localPort": request.local_port,
                        "message": e.reason(),
                    }),
                ));
            }
        }
    }

    async fn handle_stop_port_forward(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: StopPortForwardRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("ssh_stop_port_forward_response", reason));
                return;
            }
        };

        let connection = self.registry.get(&ctx.client_id);
        let stopped = connection.stop_port_forward(request.local_port).await;
        ctx.send(Envelope::message(
            "ssh_stop_port_forward_response",
            json!({ "success": stopped, "localPort": request.local_port }),
        ));
    }
}

#[async_trait]
impl MessageHandler for SshHandler {
    fn prefix(&self) -> &'static str {
        "ssh_"
    }

    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope) {
        match envelope.kind.as_str() {
            "ssh_connect" => self.handle_connect(ctx, envelope).await,
            "ssh_start_shell" => self.handle_start_shell(ctx, envelope).await,
            "ssh_input" => self.handle_input(ctx, envelope).await,
            "ssh_resize" => self.handle_resize(ctx, envelope).await,
            "ssh_close_shell" => self.handle_close_shell(ctx, envelope).await,
            "ssh_list_shells" => self.handle_list_shells(ctx).await,
            "ssh_disconnect" => self.handle_disconnect(ctx).await,
            "ssh_port_forward" => self.handle_port_forward(ctx, envelope).await,
            "ssh_stop_port_forward" => self.handle_stop_port_forward(ctx, envelope).await,
            other => {
                warn!("client {}: unknown ssh message '{}'", ctx.client_id, other);
            }
        }
    }

    async fn cleanup(&self, client_id: &str) {
        self.registry.remove(client_id).await;
        self.event_channels.remove(client_id);
        debug!("ssh handler cleaned up client {}", client_id);
    }
}
