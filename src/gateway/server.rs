//! Transport session layer: WebSocket accept, authentication gate and the
//! per-client cleanup cascade.
//!
//! Connection states: accepted/unauthenticated -> authenticated -> closed.
//! When a secret is configured, the only message accepted before a
//! successful `auth` is `auth` itself; everything else is answered with an
//! error envelope and not routed. An empty secret authenticates every
//! connection at accept time (explicit development-mode bypass). A failed
//! auth leaves the connection open; the client may retry.
//!
//! On transport close the layer removes the client's remote connection and
//! runs every handler's per-client cleanup before discarding the identity.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::web::Data;
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::{IntoResponse, handler};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::config::GatewayConfig;
use crate::gateway::protocol::{AuthRequest, Envelope};
use crate::gateway::router::{ClientContext, MessageRouter};

/// Shared server state injected into the WebSocket endpoint.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub router: Arc<MessageRouter>,
}

/// WebSocket upgrade endpoint; one upgraded socket is one client session.
#[handler]
pub async fn ws_endpoint(ws: WebSocket, state: Data<&Arc<GatewayState>>) -> impl IntoResponse {
    let state = state.0.clone();
    ws.on_upgrade(move |socket| async move {
        handle_client(socket, state).await;
    })
}

/// Liveness probe.
#[handler]
pub fn healthz() -> &'static str {
    "ok"
}

/// Whether a presented token authenticates against the configured secret.
///
/// An empty secret accepts any token.
pub(crate) fn token_matches(secret: &str, token: &str) -> bool {
    secret.is_empty() || secret == token
}

/// Run one client session until its transport closes.
async fn handle_client(socket: WebSocketStream, state: Arc<GatewayState>) {
    let client_id = Uuid::new_v4().to_string();
    info!("client {} connected", client_id);

    let (mut sink, mut stream) = socket.split();

    // All outbound traffic funnels through one channel and one writer
    // task, which keeps per-client message order intact.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let ctx = ClientContext::new(client_id.clone(), outbound_tx);
    let mut authenticated = state.config.secret.is_empty();

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                process_inbound(&state, &ctx, &mut authenticated, &text).await;
            }
            Ok(Message::Close(_)) => {
                debug!("client {} sent close", client_id);
                break;
            }
            Ok(_) => {
                // Ping/pong/binary frames carry no protocol messages
            }
            Err(e) => {
                debug!("client {} receive error: {}", client_id, e);
                break;
            }
        }
    }

    // Cleanup cascade: the ssh handler removes and disconnects the
    // client's remote connection; every other handler drops its own
    // per-client state.
    state.router.cleanup(&client_id).await;
    writer.abort();
    info!("client {} disconnected", client_id);
}

/// Decode and route one inbound text frame, enforcing the auth gate.
async fn process_inbound(
    state: &GatewayState,
    ctx: &ClientContext,
    authenticated: &mut bool,
    text: &str,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            ctx.send(Envelope::error("error", format!("invalid message: {}", e)));
            return;
        }
    };

    if envelope.kind == "auth" {
        handle_auth(state, ctx, authenticated, &envelope);
        return;
    }

    if !*authenticated {
        ctx.send(Envelope::error(
            Envelope::response_kind(&envelope.kind),
            "not authenticated",
        ));
        return;
    }

    state.router.dispatch(ctx, &envelope).await;
}

fn handle_auth(
    state: &GatewayState,
    ctx: &ClientContext,
    authenticated: &mut bool,
    envelope: &Envelope,
) {
    let request: AuthRequest = match envelope.parse_data() {
        Ok(request) => request,
        Err(reason) => {
            ctx.send(Envelope::error("auth_response", reason));
            return;
        }
    };

    if token_matches(&state.config.secret, &request.token) {
        *authenticated = true;
        ctx.send(Envelope::message("auth_response", json!({ "success": true })));
    } else {
        warn!("client {} failed authentication", ctx.client_id);
        ctx.send(Envelope::message(
            "auth_response",
            json!({ "success": false, "message": "invalid token" }),
        ));
    }
}
