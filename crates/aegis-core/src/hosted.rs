//! Hosted identity provider endpoints (authorize + token).
//!
//! The provider runs the actual login UI; this module only builds the
//! redirect into it and exchanges/refreshes tokens against
//! `{domain}/oauth2/token`. Tokens are never logged or displayed in full.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::session::TokenSet;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_secs()).ok())
        .unwrap_or(u64::MAX)
}

/// Hosted-UI provider endpoints and client identity.
#[derive(Debug, Clone)]
pub struct HostedProvider {
    /// Provider base URL, e.g. `https://auth.example.com`.
    pub domain: String,
    /// Public app client id (not a secret).
    pub client_id: String,
    /// Redirect target registered with the provider.
    pub redirect_uri: String,
    /// Space-separated OAuth scopes.
    pub scope: String,
}

impl HostedProvider {
    /// Build the hosted-UI authorization URL for the code flow.
    pub fn authorize_url(&self, state: &str) -> String {
        let params = [
            ("response_type", "code"),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("scope", self.scope.as_str()),
            ("state", state),
        ];

        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        format!("{}/oauth2/authorize?{query}", self.domain)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// Returns an error on transport failure, non-2xx status, or a malformed
    /// response body. Callers treat any of these as "exchange failed" and
    /// fall back to polling; nothing is surfaced to the user.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("client_id", &self.client_id)
            .append_pair("code", code)
            .append_pair("redirect_uri", &self.redirect_uri)
            .finish();

        let token_data = self.post_token(body).await?;

        let username = token_data
            .username
            .or_else(|| username_from_id_token(&token_data.id_token))
            .context("Token response carries no username and the identity token has none")?;

        Ok(TokenSet {
            access_token: token_data.access_token,
            id_token: token_data.id_token,
            refresh_token: token_data.refresh_token,
            username,
        })
    }

    /// Refresh the session from a previously issued refresh token.
    ///
    /// Refresh responses may omit the refresh token and username; gaps are
    /// filled from `current`.
    ///
    /// # Errors
    /// Returns an error on transport failure, non-2xx status, or a malformed
    /// response body.
    pub async fn refresh_session(&self, current: &TokenSet) -> Result<TokenSet> {
        let refresh = current
            .refresh_token
            .as_deref()
            .context("No refresh token persisted for the current session")?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("client_id", &self.client_id)
            .append_pair("refresh_token", refresh)
            .finish();

        let token_data = self.post_token(body).await?;

        Ok(TokenSet {
            access_token: token_data.access_token,
            id_token: token_data.id_token,
            refresh_token: token_data
                .refresh_token
                .or_else(|| current.refresh_token.clone()),
            username: token_data
                .username
                .unwrap_or_else(|| current.username.clone()),
        })
    }

    async fn post_token(&self, body: String) -> Result<TokenResponse> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/oauth2/token", self.domain))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .context("Failed to send token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Token request failed (HTTP {status}): {body}");
        }

        response
            .json()
            .await
            .context("Failed to parse token response")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    id_token: String,
    refresh_token: Option<String>,
    username: Option<String>,
}

/// Decodes the payload of a JWT without verifying the signature.
///
/// Verification is delegated to the provider's endpoints; the client only
/// reads claims for display and expiry checks.
pub fn decode_claims(token: &str) -> Option<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Returns whether an identity token is usable for UI purposes: decodable
/// payload with an `exp` claim still in the future. Undecodable tokens count
/// as unusable.
pub fn id_token_usable(token: &str) -> bool {
    decode_claims(token)
        .and_then(|claims| claims.get("exp").and_then(serde_json::Value::as_u64))
        .is_some_and(|exp| exp > now_secs())
}

/// Extracts a username claim from an identity token (implicit flow has no
/// token-endpoint response to take it from).
pub fn username_from_id_token(token: &str) -> Option<String> {
    let claims = decode_claims(token)?;
    for key in ["username", "cognito:username", "sub"] {
        if let Some(value) = claims.get(key).and_then(serde_json::Value::as_str) {
            return Some(value.to_string());
        }
    }
    None
}

/// Returns a masked version of a token for display (first 12 chars + ...).
pub fn mask_token(token: &str) -> String {
    if token.len() <= 16 {
        return "***".to_string();
    }
    format!("{}...", &token[..12])
}
