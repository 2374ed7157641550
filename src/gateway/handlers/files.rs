//! Handler for the `file_` message family: directory listing and tree
//! rendering over the gateway host's file system.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::gateway::protocol::{Envelope, FileEntry, FileListRequest, FileTreeRequest};
use crate::gateway::router::{ClientContext, MessageHandler};

/// Depth cap applied when the client does not supply one.
const DEFAULT_TREE_DEPTH: usize = 3;

/// Handler owning the `file_` prefix.
pub struct FilesHandler;

impl FilesHandler {
    pub fn new() -> Self {
        Self
    }

    async fn handle_list(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: FileListRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("file_list_response", reason));
                return;
            }
        };

        match list_directory(&request.path).await {
            Ok(entries) => {
                ctx.send(Envelope::message(
                    "file_list_response",
                    json!({ "path": request.path, "entries": entries }),
                ));
            }
            Err(e) => {
                ctx.send(Envelope::error(
                    "file_list_response",
                    format!("failed to list {}: {}", request.path, e),
                ));
            }
        }
    }

    async fn handle_tree(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: FileTreeRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("file_tree_response", reason));
                return;
            }
        };

        let path = request.path.clone();
        let max_depth = request.max_depth.unwrap_or(DEFAULT_TREE_DEPTH);

        // WalkDir is synchronous; keep it off the event loop
        let rendered =
            tokio::task::spawn_blocking(move || generate_tree(&path, max_depth)).await;

        match rendered {
            Ok(Ok(tree)) => {
                ctx.send(Envelope::message(
                    "file_tree_response",
                    json!({ "path": request.path, "tree": tree }),
                ));
            }
            Ok(Err(e)) => {
                ctx.send(Envelope::error(
                    "file_tree_response",
                    format!("failed to walk {}: {}", request.path, e),
                ));
            }
            Err(e) => {
                ctx.send(Envelope::error(
                    "file_tree_response",
                    format!("tree generation failed: {}", e),
                ));
            }
        }
    }
}

impl Default for FilesHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for FilesHandler {
    fn prefix(&self) -> &'static str {
        "file_"
    }

    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope) {
        match envelope.kind.as_str() {
            "file_list" => self.handle_list(ctx, envelope).await,
            "file_tree" => self.handle_tree(ctx, envelope).await,
            other => {
                warn!("client {}: unknown file message '{}'", ctx.client_id, other);
            }
        }
    }
}

/// List one directory's entries, directories first, each group sorted by
/// name. Hidden entries are included; filtering is the client's concern.
async fn list_directory(path: &str) -> std::io::Result<Vec<FileEntry>> {
    let mut reader = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(FileEntry {
            path: entry.path().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: if metadata.is_file() {
                Some(metadata.len())
            } else {
                None
            },
            name,
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));
    Ok(entries)
}

/// Render an indented directory tree, capped at `max_depth` levels below
/// the root. Directories carry a trailing slash.
fn generate_tree(path: &str, max_depth: usize) -> std::io::Result<String> {
    let root = Path::new(path);
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("{} is not a directory", path),
        ));
    }

    let mut lines = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth.max(1))
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Unreadable subtrees are skipped, not fatal
                tracing::debug!("tree walk skipped entry: {}", e);
                continue;
            }
        };
        let depth = entry.depth();
        let name = entry.file_name().to_string_lossy();
        let suffix = if entry.file_type().is_dir() { "/" } else { "" };
        lines.push(format!("{}{}{}", "  ".repeat(depth - 1), name, suffix));
    }

    Ok(lines.join("\n"))
}
