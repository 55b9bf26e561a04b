//! Token verification backends.
//!
//! `StaticTokenAuth` and `DenyAllAuth` live in core; this module adds the
//! HTTP verifier and the config-driven selection between them. The handshake
//! budget (2 s by default) is enforced by the connection, not here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use cartwheel_core::config::Config;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::stores::{StaticTokenAuth, TokenAuth};
use cartwheel_core::types::Principal;

/// Verifies tokens against a remote endpoint. The verifier receives
/// `{"token": "..."}` and answers a [`Principal`] record on success, or a
/// 401/403 for unknown and revoked tokens.
pub struct HttpTokenAuth {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpTokenAuth {
    pub fn new(verify_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl TokenAuth for HttpTokenAuth {
    async fn verify(&self, token: &str) -> Result<Principal> {
        let response = self
            .client
            .post(&self.verify_url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|e| CartwheelError::Auth(format!("verifier unreachable: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CartwheelError::Auth("invalid token".into()));
        }
        if !status.is_success() {
            return Err(CartwheelError::Auth(format!("verifier answered {status}")));
        }

        let principal: Principal = response
            .json()
            .await
            .map_err(|e| CartwheelError::Auth(format!("malformed verifier reply: {e}")))?;
        debug!(user_id = %principal.user_id, "token verified");
        Ok(principal)
    }
}

/// Build the token verifier the config asks for. `Ok(None)` means no auth is
/// configured; the caller decides whether to fail closed or mint a token.
pub fn auth_from_config(config: &Config) -> Result<Option<Arc<dyn TokenAuth>>> {
    let Some(auth) = config.gateway.as_ref().and_then(|g| g.auth.as_ref()) else {
        return Ok(None);
    };

    match auth.effective_mode() {
        "static" => {
            let token = auth.resolve_token().ok_or_else(|| {
                CartwheelError::Config("auth mode 'static' needs gateway.auth.token".into())
            })?;
            Ok(Some(Arc::new(StaticTokenAuth::new(&token))))
        }
        "http" => {
            let url = auth.verify_url.clone().ok_or_else(|| {
                CartwheelError::Config("auth mode 'http' needs gateway.auth.verify_url".into())
            })?;
            Ok(Some(Arc::new(HttpTokenAuth::new(url))))
        }
        "none" => Ok(None),
        other => Err(CartwheelError::Config(format!(
            "unknown auth mode '{other}'"
        ))),
    }
}
