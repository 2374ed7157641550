//! Handler for the `git_` message family: status, diff, staging and commit
//! operations wrapping the git CLI.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::process::Command;
use tracing::warn;

use crate::gateway::protocol::{
    Envelope, GitCommitRequest, GitDiffRequest, GitFileRequest, GitStatusRequest,
};
use crate::gateway::router::{ClientContext, MessageHandler};

/// One changed file in a status response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFileStatus {
    pub path: String,
    pub status: String,
}

/// Parsed working-tree status.
#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    pub branch: String,
    pub staged: Vec<GitFileStatus>,
    pub unstaged: Vec<GitFileStatus>,
    pub untracked: Vec<String>,
}

/// Handler owning the `git_` prefix.
pub struct GitHandler;

impl GitHandler {
    pub fn new() -> Self {
        Self
    }

    async fn handle_status(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: GitStatusRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("git_status_response", reason));
                return;
            }
        };

        match collect_status(&request.path).await {
            Ok(status) => {
                ctx.send(Envelope::message(
                    "git_status_response",
                    serde_json::to_value(status).unwrap_or_default(),
                ));
            }
            Err(reason) => {
                ctx.send(Envelope::error("git_status_response", reason));
            }
        }
    }

    async fn handle_diff(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: GitDiffRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("git_diff_response", reason));
                return;
            }
        };

        let mut args = vec!["diff"];
        if request.staged {
            args.push("--cached");
        }
        args.push("--");
        args.push(&request.file);

        match run_git(&request.path, &args).await {
            Ok(diff) => {
                ctx.send(Envelope::message(
                    "git_diff_response",
                    json!({ "file": request.file, "diff": diff }),
                ));
            }
            Err(reason) => {
                ctx.send(Envelope::error("git_diff_response", reason));
            }
        }
    }

    async fn handle_commit(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: GitCommitRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error("git_commit_response", reason));
                return;
            }
        };

        match run_git(&request.path, &["commit", "-m", &request.message]).await {
            Ok(output) => {
                ctx.send(Envelope::message(
                    "git_commit_response",
                    json!({ "success": true, "message": output.trim() }),
                ));
            }
            Err(reason) => {
                ctx.send(Envelope::message(
                    "git_commit_response",
                    json!({ "success": false, "message": reason }),
                ));
            }
        }
    }

    async fn handle_file_op(&self, ctx: &ClientContext, envelope: &Envelope) {
        let request: GitFileRequest = match envelope.parse_data() {
            Ok(r) => r,
            Err(reason) => {
                ctx.send(Envelope::error(
                    Envelope::response_kind(&envelope.kind),
                    reason,
                ));
                return;
            }
        };

        let args: &[&str] = match envelope.kind.as_str() {
            "git_stage" => &["add", "--", &request.file],
            "git_unstage" => &["reset", "HEAD", "--", &request.file],
            "git_discard" => &["checkout", "--", &request.file],
            _ => unreachable!("handle_file_op called for {}", envelope.kind),
        };

        let reply_kind = Envelope::response_kind(&envelope.kind);
        match run_git(&request.path, args).await {
            Ok(_) => {
                ctx.send(Envelope::message(reply_kind, json!({ "success": true })));
            }
            Err(reason) => {
                ctx.send(Envelope::message(
                    reply_kind,
                    json!({ "success": false, "message": reason }),
                ));
            }
        }
    }
}

impl Default for GitHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for GitHandler {
    fn prefix(&self) -> &'static str {
        "git_"
    }

    async fn handle(&self, ctx: &ClientContext, envelope: &Envelope) {
        match envelope.kind.as_str() {
            "git_status" => self.handle_status(ctx, envelope).await,
            "git_diff" => self.handle_diff(ctx, envelope).await,
            "git_commit" => self.handle_commit(ctx, envelope).await,
            "git_stage" | "git_unstage" | "git_discard" => {
                self.handle_file_op(ctx, envelope).await
            }
            other => {
                warn!("client {}: unknown git message '{}'", ctx.client_id, other);
            }
        }
    }
}

/// Run one git command in `repo_path`, returning stdout on success.
async fn run_git(repo_path: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .await
        .map_err(|e| format!("failed to run git: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git {} failed: {}", args[0], stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Gather branch name and porcelain status for a repository.
async fn collect_status(repo_path: &str) -> Result<GitStatus, String> {
    // Distinguish not-a-repo from other git failures
    run_git(repo_path, &["rev-parse", "--git-dir"])
        .await
        .map_err(|_| format!("{} is not a git repository", repo_path))?;

    // symbolic-ref resolves the branch even before the first commit;
    // rev-parse covers detached HEAD
    let branch = match run_git(repo_path, &["symbolic-ref", "--short", "HEAD"]).await {
        Ok(branch) => branch.trim().to_string(),
        Err(_) => run_git(repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map(|branch| branch.trim().to_string())
            .unwrap_or_default(),
    };

    let porcelain = run_git(repo_path, &["status", "--porcelain=v1"]).await?;
    let mut status = parse_porcelain(&porcelain);
    status.branch = branch;
    Ok(status)
}

/// Parse `git status --porcelain=v1` output.
///
/// Each line is `XY path`: X is the index (staged) state, Y the worktree
/// state, `??` marks untracked files. A file can appear in both the staged
/// and unstaged lists (e.g. `MM`).
fn parse_porcelain(output: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (codes, path) = line.split_at(3);
        let path = path.to_string();
        let staged_code = &codes[0..1];
        let unstaged_code = &codes[1..2];

        if codes.starts_with("??") {
            status.untracked.push(path);
            continue;
        }

        if staged_code != " " {
            status.staged.push(GitFileStatus {
                path: path.clone(),
                status: staged_code.to_string(),
            });
        }
        if unstaged_code != " " {
            status.unstaged.push(GitFileStatus {
                path,
                status: unstaged_code.to_string(),
            });
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    mod porcelain_parsing {
        use super::*;

        #[test]
        fn test_staged_and_unstaged_split() {
            let output = "M  src/staged.rs\n M src/unstaged.rs\nMM src/both.rs\n?? new.txt\n";
            let status = parse_porcelain(output);

            assert_eq!(
                status.staged,
                vec![
                    GitFileStatus {
                        path: "src/staged.rs".to_string(),
                        status: "M".to_string()
                    },
                    GitFileStatus {
                        path: "src/both.rs".to_string(),
                        status: "M".to_string()
                    },
                ]
            );
            assert_eq!(
                status.unstaged,
                vec![
                    GitFileStatus {
                        path: "src/unstaged.rs".to_string(),
                        status: "M".to_string()
                    },
                    GitFileStatus {
                        path: "src/both.rs".to_string(),
                        status: "M".to_string()
                    },
                ]
            );
            assert_eq!(status.untracked, vec!["new.txt".to_string()]);
        }

        #[test]
        fn test_added_and_deleted_codes() {
            let output = "A  added.rs\nD  deleted.rs\n D gone.rs\n";
            let status = parse_porcelain(output);

            assert_eq!(status.staged.len(), 2);
            assert_eq!(status.staged[0].status, "A");
            assert_eq!(status.staged[1].status, "D");
            assert_eq!(status.unstaged.len(), 1);
            assert_eq!(status.unstaged[0].path, "gone.rs");
        }

        #[test]
        fn test_empty_output_is_clean() {
            let status = parse_porcelain("");
            assert!(status.staged.is_empty());
            assert!(status.unstaged.is_empty());
            assert!(status.untracked.is_empty());
        }

        #[test]
        fn test_short_lines_are_skipped() {
            let status = parse_porcelain("x\n\nM\n");
            assert!(status.staged.is_empty());
        }
    }

    mod repository_operations {
        use super::*;
        use std::process::Command as StdCommand;

        fn init_repo() -> tempfile::TempDir {
            let dir = tempfile::tempdir().unwrap();
            let run = |args: &[&str]| {
                let output = StdCommand::new("git")
                    .args(args)
                    .current_dir(dir.path())
                    .output()
                    .expect("git must be installed");
                assert!(output.status.success(), "git {:?} failed", args);
            };
            run(&["init", "-q"]);
            run(&["config", "user.email", "dev@example.com"]);
            run(&["config", "user.name", "Dev"]);
            dir
        }

        #[tokio::test]
        async fn test_status_of_non_repo_errors() {
            let dir = tempfile::tempdir().unwrap();
            let result = collect_status(dir.path().to_str().unwrap()).await;
            assert!(result.is_err());
            assert!(result.unwrap_err().contains("not a git repository"));
        }

        #[tokio::test]
        async fn test_untracked_file_appears_in_status() {
            let dir = init_repo();
            std::fs::write(dir.path().join("hello.txt"), "hi\n").unwrap();

            let status = collect_status(dir.path().to_str().unwrap()).await.unwrap();
            assert_eq!(status.untracked, vec!["hello.txt".to_string()]);
        }

        #[tokio::test]
        async fn test_stage_then_commit_clears_status() {
            let dir = init_repo();
            let path = dir.path().to_str().unwrap().to_string();
            std::fs::write(dir.path().join("hello.txt"), "hi\n").unwrap();

            run_git(&path, &["add", "--", "hello.txt"]).await.unwrap();
            let staged = collect_status(&path).await.unwrap();
            assert_eq!(staged.staged.len(), 1);
            assert_eq!(staged.staged[0].status, "A");

            run_git(&path, &["commit", "-q", "-m", "add hello"]).await.unwrap();
            let clean = collect_status(&path).await.unwrap();
            assert!(clean.staged.is_empty());
            assert!(clean.untracked.is_empty());
        }
    }

    mod handler {
        use super::*;
        use tokio::sync::mpsc;

        #[tokio::test]
        async fn test_status_failure_is_error_envelope() {
            let handler = GitHandler::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let ctx = ClientContext::new("c1".to_string(), tx);
            let dir = tempfile::tempdir().unwrap();

            handler
                .handle(
                    &ctx,
                    &Envelope::message("git_status", json!({"path": dir.path()})),
                )
                .await;

            let reply = rx.recv().await.unwrap();
            assert_eq!(reply.kind, "git_status_response");
            assert!(reply.error.unwrap().contains("not a git repository"));
        }

        #[tokio::test]
        async fn test_commit_failure_reports_success_false() {
            let handler = GitHandler::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let ctx = ClientContext::new("c1".to_string(), tx);
            let dir = tempfile::tempdir().unwrap();

            handler
                .handle(
                    &ctx,
                    &Envelope::message(
                        "git_commit",
                        json!({"path": dir.path(), "message": "nope"}),
                    ),
                )
                .await;

            let reply = rx.recv().await.unwrap();
            assert_eq!(reply.kind, "git_commit_response");
            assert_eq!(reply.data.unwrap()["success"], json!(false));
        }
    }
}
