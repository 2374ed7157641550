//! SSH connection establishment and authentication.
//!
//! The connect path is:
//!
//! 1. Build the russh client configuration (keepalive, no inactivity
//!    timeout; gateway connections stay open until a client or the remote
//!    side tears them down).
//! 2. Open the TCP connection and run the SSH handshake under the
//!    configured bounded timeout.
//! 3. Authenticate with the credential supplied in the connect request:
//!    PEM private-key material if present, otherwise a password.
//!
//! Failures are terminal: the gateway never retries a connect on its own.
//! The client owns reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use russh::{client, keys};
use tracing::debug;

use crate::gateway::error::{GatewayError, GatewayResult};

/// Client handler for russh that accepts all host keys.
///
/// This implementation accepts all server public keys without verification,
/// similar to `StrictHostKeyChecking=no` in OpenSSH configuration.
///
/// # Security Note
///
/// In production environments, you should implement proper host key
/// verification against a known_hosts file to prevent man-in-the-middle
/// attacks.
pub struct GatewayClientHandler;

impl client::Handler for GatewayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all host keys (similar to StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Build the russh client configuration used for gateway connections.
///
/// Keepalives run every 30 seconds with a maximum of 3 missed replies;
/// there is no inactivity timeout because an idle editor session must not
/// drop its shells.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Open an authenticated SSH session to `host:port`.
///
/// The whole TCP connect + handshake is bounded by `timeout`; on expiry the
/// attempt fails rather than hanging. Authentication tries the private key
/// when one was supplied, falling back to the password otherwise. The
/// failure reason always carries the underlying cause.
pub(crate) async fn connect_and_authenticate(
    host: &str,
    port: u16,
    username: &str,
    password: Option<&str>,
    private_key: Option<&str>,
    timeout: Duration,
) -> GatewayResult<client::Handle<GatewayClientHandler>> {
    let config = build_client_config();

    let connect_future = client::connect(config, (host, port), GatewayClientHandler);

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| {
            GatewayError::Remote(format!(
                "connection to {}:{} timed out after {:?}",
                host, port, timeout
            ))
        })?
        .map_err(|e| GatewayError::Remote(format!("failed to connect to {}:{}: {}", host, port, e)))?;

    let authenticated = match (private_key, password) {
        (Some(key_data), _) => authenticate_key(&mut handle, username, key_data).await?,
        (None, Some(password)) => authenticate_password(&mut handle, username, password).await?,
        (None, None) => {
            return Err(GatewayError::Remote(
                "no credentials supplied: provide a password or private key".to_string(),
            ));
        }
    };

    if !authenticated {
        return Err(GatewayError::Remote(
            "authentication rejected by remote host".to_string(),
        ));
    }

    Ok(handle)
}

/// Authenticate with a username/password pair.
async fn authenticate_password(
    handle: &mut client::Handle<GatewayClientHandler>,
    username: &str,
    password: &str,
) -> GatewayResult<bool> {
    let result = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| GatewayError::Remote(format!("password authentication failed: {}", e)))?;

    Ok(result.success())
}

/// Authenticate with PEM private-key material supplied by the client.
///
/// Key material arrives over the wire in the connect request, so it is
/// decoded from the string rather than loaded from a file. Passphrase-
/// protected keys are not supported.
async fn authenticate_key(
    handle: &mut client::Handle<GatewayClientHandler>,
    username: &str,
    key_data: &str,
) -> GatewayResult<bool> {
    let key_pair = keys::decode_secret_key(key_data, None)
        .map_err(|e| GatewayError::Remote(format!("failed to decode private key: {}", e)))?;

    // For RSA keys, use the best supported hash algorithm
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

    let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

    let result = handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(|e| GatewayError::Remote(format!("key authentication failed: {}", e)))?;

    Ok(result.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod client_config {
        use super::*;

        #[test]
        fn test_no_inactivity_timeout() {
            let config = build_client_config();
            assert_eq!(config.inactivity_timeout, None);
        }

        #[test]
        fn test_keepalive_settings() {
            let config = build_client_config();
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }
    }

    mod connect {
        use super::*;

        #[tokio::test]
        async fn test_connect_timeout_is_bounded() {
            // 203.0.113.0/24 is TEST-NET-3, guaranteed unroutable
            let started = std::time::Instant::now();
            let result = connect_and_authenticate(
                "203.0.113.1",
                22,
                "dev",
                Some("pw"),
                None,
                Duration::from_millis(250),
            )
            .await;

            assert!(result.is_err());
            assert!(started.elapsed() < Duration::from_secs(5));
            let reason = result.err().map(|e| e.reason()).unwrap_or_default();
            assert!(
                reason.contains("timed out") || reason.contains("failed to connect"),
                "unexpected reason: {}",
                reason
            );
        }

        #[tokio::test]
        async fn test_rejects_missing_credentials_without_connecting() {
            // Credential validation happens after the handshake, so use an
            // address that fails fast to keep the test local-only.
            let result = connect_and_authenticate(
                "127.0.0.1",
                1, // nothing listens on port 1
                "dev",
                None,
                None,
                Duration::from_millis(500),
            )
            .await;

            assert!(result.is_err());
        }

        #[tokio::test]
        async fn test_invalid_key_material_is_rejected() {
            let mut handle_err = None;
            // decode_secret_key runs before any network use of the key
            if let Err(e) = keys::decode_secret_key("not a key", None) {
                handle_err = Some(e.to_string());
            }
            assert!(handle_err.is_some());
        }
    }
}
