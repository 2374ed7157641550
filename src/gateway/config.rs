//! Configuration resolution for the gateway server.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DEVGATE_PORT` | 8420 | WebSocket listen port |
//! | `DEVGATE_SECRET` | (empty) | Shared auth secret; empty accepts any token |
//! | `DEVGATE_SSH_CONNECT_TIMEOUT` | 30s | SSH connection timeout in seconds |
//! | `DEVGATE_AGENT_LOG_DIR` | `~/.devagent/sessions` | Agent session-log directory |

use std::env;
use std::time::Duration;

/// Default WebSocket listen port
pub(crate) const DEFAULT_PORT: u16 = 8420;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Environment variable name for the listen port
pub(crate) const PORT_ENV_VAR: &str = "DEVGATE_PORT";

/// Environment variable name for the shared auth secret
pub(crate) const SECRET_ENV_VAR: &str = "DEVGATE_SECRET";

/// Environment variable name for the SSH connection timeout
pub(crate) const SSH_CONNECT_TIMEOUT_ENV_VAR: &str = "DEVGATE_SSH_CONNECT_TIMEOUT";

/// Environment variable name for the agent session-log directory
pub(crate) const AGENT_LOG_DIR_ENV_VAR: &str = "DEVGATE_AGENT_LOG_DIR";

/// Runtime configuration assembled once at startup and injected into the
/// server, router and handlers.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port the WebSocket server listens on.
    pub port: u16,
    /// Shared secret compared against the client's `auth` token. An empty
    /// secret accepts any token (explicit development-mode bypass).
    pub secret: String,
    /// Bounded timeout applied to SSH connect attempts.
    pub ssh_connect_timeout: Duration,
    /// Directory of `*.jsonl` agent session logs watched by the monitor.
    pub agent_log_dir: String,
}

impl GatewayConfig {
    /// Assemble configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            port: resolve_port(None),
            secret: resolve_secret(None),
            ssh_connect_timeout: Duration::from_secs(resolve_ssh_connect_timeout(None)),
            agent_log_dir: resolve_agent_log_dir(None),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            secret: String::new(),
            ssh_connect_timeout: Duration::from_secs(DEFAULT_SSH_CONNECT_TIMEOUT_SECS),
            agent_log_dir: default_agent_log_dir(),
        }
    }
}

/// Resolve the listen port with priority: parameter -> env var -> default
pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    if let Some(port) = port_param {
        return port;
    }

    if let Ok(env_port) = env::var(PORT_ENV_VAR)
        && let Ok(port) = env_port.parse::<u16>()
    {
        return port;
    }

    DEFAULT_PORT
}

/// Resolve the shared secret with priority: parameter -> env var -> empty
pub(crate) fn resolve_secret(secret_param: Option<String>) -> String {
    if let Some(secret) = secret_param {
        return secret;
    }

    env::var(SECRET_ENV_VAR).unwrap_or_default()
}

/// Resolve the SSH connect timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_ssh_connect_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(SSH_CONNECT_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_SSH_CONNECT_TIMEOUT_SECS
}

/// Resolve the agent session-log directory with priority: parameter -> env var -> default
pub(crate) fn resolve_agent_log_dir(dir_param: Option<String>) -> String {
    if let Some(dir) = dir_param {
        return dir;
    }

    if let Ok(dir) = env::var(AGENT_LOG_DIR_ENV_VAR)
        && !dir.is_empty()
    {
        return dir;
    }

    default_agent_log_dir()
}

fn default_agent_log_dir() -> String {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.devagent/sessions", home)
}
