//! Handler for the `agent_` message family: passive monitoring of an
//! external coding agent's session logs.
//!
//! The agent writes one `*.jsonl` file per session under a log directory.
//! A single directory watcher (started lazily with the first subscriber)
//! tails appended lines from remembered per-file offsets, parses each line
//! into an [`AgentEvent`] and fans it out to every subscribed client. Only
//! lines appended after the watcher started are forwarded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use notify::{EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::gateway::protocol::{AgentSubscribeRequest, Envelope};
use crate::gateway::router::{ClientContext, MessageHandler};

/// Discrete event kinds recognized in agent session logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    UserInput,
    AssistantMessage,
    ToolCall,
    ToolResult,
    FileChange,
}

/// One parsed session-log event, forwarded verbatim-payload to clients.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub timestamp: String,
    pub payload: Value,
}

/// Handler owning the `agent_` prefix.
pub struct MonitorHandler {
    default_dir: String,
    subscribers: Arc<DashMap<String, ClientContext>>,
    /// Directory currently being watched, if the watcher has started.
    watched_dir: Mutex<Option<String>>,
}

impl MonitorHandler {
    pub fn new(default_dir: String) -> Self {
        Self {
            default_dir,
            subscribers: Arc::new(DashMap::new()),
            watched_dir: Mutex::new(None),
        }
    }

    async fn handle_subscribe(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: AgentSubscribeRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("agent_subscribe_response", reason));
                return;
            }
        };

        let requested_dir = request.path.unwrap_or_else(|| self.default_dir.clone());

        let mut watched = self.watched_dir.lock().await;
        let message = match watched.as_ref() {
            Some(dir) => format!("already watching {}", dir),
            None => match start_watcher(requested_dir.clone(), self.subscribers.clone()) {
                Ok(()) => {
                    *watched = Some(requested_dir.clone());
                    format!("watching {}", requested_dir)
                }
                Err(reason) => {
                    ctx.send(Envelope::error("agent_subscribe_response", reason));
                    return;
                }
            },
        };
        drop(watched);

        self.subscribers.insert(ctx.client_id.clone(), ctx.clone());
        ctx.send(Envelope::message(
            "agent_subscribe_response",
            json!({ "success": true, "message": message }),
        ));
    }

    fn handle_unsubscribe(&self, ctx: &ClientContext) {
        self.subscribers.remove(&ctx.client_id);
        ctx.send(Envelope::message(
            "agent_unsubscribe_response",
            json!({ "success": true }),
        ));
    }
}

#[async_trait]
impl MessageHandler for MonitorHandler {
    fn prefix(&self) -> &'static str {
        "agent_"
    }

    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope) {
        match envelope.kind.as_str() {
            "agent_subscribe" => self.handle_subscribe(ctx, envelope).await,
            "agent_unsubscribe" => self.handle_unsubscribe(ctx),
            other => {
                warn!("client {}: unknown agent message '{}'", ctx.client_id, other);
            }
        }
    }

    async fn cleanup(&self, client_id: &str) {
        self.subscribers.remove(client_id);
    }
}

/// Start the directory watcher and its event-forwarding task.
///
/// The watcher handle lives inside the spawned task; dropping the task
/// would stop the watch, so the task runs for the life of the process.
fn start_watcher(
    dir: String,
    subscribers: Arc<DashMap<String, ClientContext>>,
) -> Result<(), String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(err) => {
                error!("session log watcher error: {}", err);
            }
        },
    )
    .map_err(|e| format!("failed to initialize session log watcher: {}", e))?;

    watcher
        .watch(Path::new(&dir), RecursiveMode::Recursive)
        .map_err(|e| format!("failed to watch {}: {}", dir, e))?;

    info!("watching agent session logs under {}", dir);

    tokio::spawn(async move {
        // The watcher must outlive its callback; it lives and dies with
        // this task.
        let _watcher = watcher;

        // Tail semantics: existing content is skipped
        let mut offsets = initial_offsets(&dir);

        while let Some(path) = rx.recv().await {
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            let offset = offsets.get(&path).copied().unwrap_or(0);
            match read_new_events(&path, offset).await {
                Ok((events, new_offset)) => {
                    offsets.insert(path.clone(), new_offset);
                    for event in events {
                        let envelope = match serde_json::to_value(&event) {
                            Ok(value) => Envelope::message("agent_event", value),
                            Err(e) => {
                                debug!("unserializable agent event skipped: {}", e);
                                continue;
                            }
                        };
                        for subscriber in subscribers.iter() {
                            subscriber.value().send(envelope.clone());
                        }
                    }
                }
                Err(e) => {
                    debug!("failed to read {}: {}", path.display(), e);
                }
            }
        }
    });

    Ok(())
}

/// Current sizes of all session logs, so the tail starts at the end.
fn initial_offsets(dir: &str) -> HashMap<PathBuf, u64> {
    let mut offsets = HashMap::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && let Ok(metadata) = entry.metadata()
            {
                offsets.insert(path, metadata.len());
            }
        }
    }
    offsets
}

/// Read complete lines appended since `offset`.
///
/// Returns the parsed events and the new offset, which advances only past
/// the last newline so a partially-written trailing line is picked up by
/// the next change notification. A shrunken file (rotation) restarts from
/// the beginning.
async fn read_new_events(path: &Path, offset: u64) -> std::io::Result<(Vec<AgentEvent>, u64)> {
    let bytes = tokio::fs::read(path).await?;

    let offset = if (bytes.len() as u64) < offset { 0 } else { offset };
    let slice = &bytes[offset as usize..];

    let mut events = Vec::new();
    let mut consumed = 0usize;
    let mut start = 0usize;

    while let Some(pos) = slice[start..].iter().position(|&b| b == b'\n') {
        let line = &slice[start..start + pos];
        consumed = start + pos + 1;
        start = consumed;

        if let Ok(text) = std::str::from_utf8(line)
            && let Some(event) = parse_agent_line(text)
        {
            events.push(event);
        }
    }

    Ok((events, offset + consumed as u64))
}

/// Parse one session-log line into an event.
///
/// Lines that are not JSON objects, or whose `type` is not one of the
/// recognized kinds, are skipped.
fn parse_agent_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;

    let kind = match value["type"].as_str()? {
        "user_input" => AgentEventKind::UserInput,
        "assistant_message" => AgentEventKind::AssistantMessage,
        "tool_call" => AgentEventKind::ToolCall,
        "tool_result" => AgentEventKind::ToolResult,
        "file_change" => AgentEventKind::FileChange,
        _ => return None,
    };

    let timestamp = value["timestamp"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

    Some(AgentEvent {
        kind,
        timestamp,
        payload: value,
    })
}
