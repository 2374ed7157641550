//! Inbound message routing.
//!
//! Each handler owns one message-type prefix. The router tests handlers in
//! registration order and forwards to the first match; prefixes are kept
//! mutually exclusive by convention since only the first match wins. A
//! message no handler owns is logged and dropped; unknown types are not
//! an error the client hears about.
//!
//! Handlers convert every failure into an outbound envelope. Nothing a
//! handler does may terminate the client's transport connection or leak
//! into another client's stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gateway::protocol::Envelope;

/// Per-connection context handed to handlers with each message.
#[derive(Clone)]
pub struct ClientContext {
    /// Opaque identity of the transport connection, unique per client.
    pub client_id: String,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ClientContext {
    pub fn new(client_id: String, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            client_id,
            outbound,
        }
    }

    /// Queue an outbound envelope for this client.
    ///
    /// Per-client ordering is preserved by the single writer task draining
    /// the channel. Sending after the transport closed is a silent no-op.
    pub fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!("client {} outbound channel closed, message dropped", self.client_id);
        }
    }
}

/// One subsystem bound to a message-type prefix.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The message-type prefix this handler owns (e.g. `"ssh_"`).
    fn prefix(&self) -> &'static str;

    /// Whether this handler owns the message type.
    fn owns(&self, kind: &str) -> bool {
        kind.starts_with(self.prefix())
    }

    /// Handle one inbound message. Failures must surface as outbound
    /// envelopes, never as returned errors.
    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope);

    /// Release any per-client state after the client's transport closed.
    async fn cleanup(&self, client_id: &str) {
        let _ = client_id;
    }
}

/// Dispatches inbound envelopes to the first handler owning their type.
pub struct MessageRouter {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl MessageRouter {
    pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        Self { handlers }
    }

    /// Route one inbound envelope.
    pub async fn dispatch(&self, ctx: &ClientContext, envelope: &Envelope) {
        for handler in &self.handlers {
            if handler.owns(&envelope.kind) {
                handler.handle(ctx, envelope).await;
                return;
            }
        }
        warn!(
            "client {}: dropping message with unknown type '{}'",
            ctx.client_id, envelope.kind
        );
    }

    /// Run every handler's per-client cleanup hook.
    pub async fn cleanup(&self, client_id: &str) {
        for handler in &self.handlers {
            handler.cleanup(client_id).await;
        }
        debug!("cleanup cascade finished for client {}", client_id);
    }
}
