//! Handler for the `search_` message family: text search over a directory
//! tree, wrapping ripgrep as a subprocess.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::warn;

use crate::gateway::protocol::{Envelope, SearchMatch, SearchRequest};
use crate::gateway::router::{ClientContext, MessageHandler};

/// Result cap applied when the client does not supply one.
const DEFAULT_MAX_RESULTS: usize = 200;

/// Handler owning the `search_` prefix.
pub struct SearchHandler;

impl SearchHandler {
    pub fn new() -> Self {
        Self
    }

    async fn handle_query(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: SearchRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("search_query_response", reason));
                return;
            }
        };

        let max_results = request.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        match run_ripgrep(&request).await {
            Ok(output) => {
                let all = parse_ripgrep_json(&output);
                let truncated = all.len() > max_results;
                let matches: Vec<SearchMatch> = all.into_iter().take(max_results).collect();
                ctx.send(Envelope::message(
                    "search_query_response",
                    json!({ "matches": matches, "truncated": truncated }),
                ));
            }
            Err(reason) => {
                ctx.send(Envelope::error("search_query_response", reason));
            }
        }
    }
}

impl Default for SearchHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for SearchHandler {
    fn prefix(&self) -> &'static str {
        "search_"
    }

    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope) {
        match envelope.kind.as_str() {
            "search_query" => self.handle_query(ctx, envelope).await,
            other => {
                warn!("client {}: unknown search message '{}'", ctx.client_id, other);
            }
        }
    }
}

/// Run ripgrep in JSON mode and return its stdout.
///
/// Exit code 1 means "no matches" and is not an error; anything else with
/// a non-success status surfaces stderr as the reason.
async fn run_ripgrep(request: &SearchRequest) -> Result<String, String> {
    let mut command = Command::new("rg");
    command.arg("--json");
    if !request.case_sensitive {
        command.arg("-i");
    }
    command.arg("--").arg(&request.query).arg(&request.path);

    let output = command
        .output()
        .await
        .map_err(|e| format!("failed to run ripgrep: {}", e))?;

    if !output.status.success() && output.status.code() != Some(1) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("search failed: {}", stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse ripgrep's `--json` event stream into match records.
///
/// Every line is one JSON event; only `match` events contribute results.
/// Lines that fail to parse are skipped.
fn parse_ripgrep_json(output: &str) -> Vec<SearchMatch> {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| event["type"] == "match")
        .filter_map(|event| {
            let data = &event["data"];
            Some(SearchMatch {
                file: data["path"]["text"].as_str()?.to_string(),
                line: data["line_number"].as_u64()?,
                text: data["lines"]["text"].as_str()?.trim_end().to_string(),
            })
        })
        .collect()
}
