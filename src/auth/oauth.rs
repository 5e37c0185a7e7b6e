//! OAuth 2.0 authorization-code settings and token bundle types.
//!
//! Providers differ in small, annoying ways: some want the token request as a
//! form body, some as JSON; some return the token under a non-standard field;
//! one or two rename the redirect parameter. [`OAuthSettings`] captures those
//! differences declaratively so no provider needs code of its own.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How the token endpoint expects its request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRequestStyle {
    /// `application/x-www-form-urlencoded` (the common case).
    Form,
    /// A JSON object body.
    Json,
}

impl Default for TokenRequestStyle {
    fn default() -> Self {
        TokenRequestStyle::Form
    }
}

/// Declarative description of a provider's OAuth endpoints and quirks,
/// deserialized from an `oauth` step's arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub auth_url: String,
    pub token_url: String,
    /// Falls back to the `client_id` secret when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Falls back to the `client_secret` secret when absent.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub supports_pkce: bool,
    #[serde(default)]
    pub token_request: TokenRequestStyle,
    /// Response field holding the access token.
    #[serde(default = "default_token_field")]
    pub token_field: String,
    /// Parameter name for the redirect URI (a few providers rename it).
    #[serde(default = "default_redirect_param")]
    pub redirect_param: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// Link to the provider's app-registration docs, surfaced in the
    /// credential-entry interaction.
    #[serde(default)]
    pub doc_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_token_field() -> String {
    "access_token".to_string()
}

fn default_redirect_param() -> String {
    "redirect_uri".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8700/oauth/callback".to_string()
}

/// An issued token set, stored sealed under the `oauth_token` secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenBundle {
    /// Whether the token is expired or within `margin_secs` of expiring.
    /// Tokens without an expiry never count as expired.
    pub fn needs_refresh(&self, margin_secs: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + Duration::seconds(margin_secs) >= expires_at,
            None => false,
        }
    }
}

/// A pending PKCE verifier, stored sealed under the `oauth_pkce` secret key
/// between authorize-URL generation and code exchange. Single use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVerifier {
    pub verifier: String,
    pub created_at: DateTime<Utc>,
}

impl StoredVerifier {
    /// Verifiers older than ten minutes are rejected; the authorization
    /// round-trip should take seconds.
    pub fn is_expired(&self) -> bool {
        Utc::now() - self.created_at > Duration::seconds(600)
    }
}
