//! Credential acquisition: OAuth 2.0 authorization-code flow with PKCE,
//! silent refresh, and token persistence.
//!
//! The manager never talks to a browser. When authorization is required it
//! produces an authorize URL; the surrounding engine surfaces that URL as an
//! interaction and later feeds the callback code back into
//! [`AuthManager::exchange_code`].

mod oauth;
pub mod pkce;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::secrets::SecretsStore;

pub use oauth::{OAuthSettings, StoredVerifier, TokenBundle, TokenRequestStyle};

/// Secret key under which the sealed [`TokenBundle`] JSON lives.
pub const TOKEN_KEY: &str = "oauth_token";

/// Secret key for the pending PKCE verifier between authorize and exchange.
pub const VERIFIER_KEY: &str = "oauth_pkce";

pub const CLIENT_ID_KEY: &str = "client_id";
pub const CLIENT_SECRET_KEY: &str = "client_secret";

/// Refresh this many seconds before the recorded expiry, so a token handed to
/// a request cannot lapse mid-flight.
const REFRESH_MARGIN_SECS: i64 = 60;

pub struct AuthManager {
    http: reqwest::Client,
    secrets: Arc<SecretsStore>,
}

impl AuthManager {
    pub fn new(secrets: Arc<SecretsStore>) -> Self {
        AuthManager {
            http: reqwest::Client::new(),
            secrets,
        }
    }

    /// Returns a usable access token for the source, refreshing silently when
    /// the stored one is expired or about to expire. `Ok(None)` means a new
    /// interactive authorization is required.
    pub async fn resolve_token(
        &self,
        source_id: &str,
        settings: &OAuthSettings,
    ) -> Result<Option<String>> {
        let Some(bundle) = self.load_bundle(source_id)? else {
            return Ok(None);
        };

        if !bundle.needs_refresh(REFRESH_MARGIN_SECS) {
            return Ok(Some(bundle.access_token));
        }

        let Some(refresh_token) = bundle.refresh_token.clone() else {
            debug!(source = %source_id, "token expired with no refresh token");
            self.secrets.delete(source_id, TOKEN_KEY)?;
            return Ok(None);
        };

        match self.refresh(source_id, settings, &refresh_token).await {
            Ok(refreshed) => {
                info!(source = %source_id, "access token refreshed");
                Ok(Some(refreshed.access_token))
            }
            Err(e) => {
                // A dead refresh token means the grant was revoked upstream;
                // drop it and fall back to interactive authorization.
                warn!(source = %source_id, error = %e, "token refresh failed");
                self.secrets.delete(source_id, TOKEN_KEY)?;
                Ok(None)
            }
        }
    }

    /// Builds the provider authorize URL, generating and persisting a PKCE
    /// verifier when the provider supports it.
    pub fn authorize_url(&self, source_id: &str, settings: &OAuthSettings) -> Result<String> {
        let (client_id, _) = self.client_credentials(source_id, settings)?;
        let client_id =
            client_id.ok_or_else(|| anyhow!("no client_id configured for source {source_id}"))?;

        let mut params: Vec<(&str, String)> = vec![
            ("response_type", "code".to_string()),
            ("client_id", client_id),
            (settings.redirect_param.as_str(), settings.redirect_uri.clone()),
            ("state", source_id.to_string()),
        ];
        if !settings.scopes.is_empty() {
            params.push(("scope", settings.scopes.join(" ")));
        }
        if settings.supports_pkce {
            let verifier = pkce::generate_verifier();
            let stored = StoredVerifier {
                verifier: verifier.clone(),
                created_at: Utc::now(),
            };
            self.secrets.put(
                source_id,
                VERIFIER_KEY,
                &serde_json::to_string(&stored).context("failed to serialize verifier")?,
            )?;
            params.push(("code_challenge", pkce::challenge(&verifier)));
            params.push(("code_challenge_method", "S256".to_string()));
        }

        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        let separator = if settings.auth_url.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", settings.auth_url, separator, query.join("&")))
    }

    /// Exchanges an authorization code for tokens and persists the bundle.
    /// Consumes the pending PKCE verifier; a verifier is single use.
    pub async fn exchange_code(
        &self,
        source_id: &str,
        settings: &OAuthSettings,
        code: &str,
    ) -> Result<TokenBundle> {
        let (client_id, client_secret) = self.client_credentials(source_id, settings)?;
        let client_id =
            client_id.ok_or_else(|| anyhow!("no client_id configured for source {source_id}"))?;

        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            (settings.redirect_param.as_str(), settings.redirect_uri.clone()),
            ("client_id", client_id),
        ];
        if let Some(secret) = client_secret {
            params.push(("client_secret", secret));
        }
        if settings.supports_pkce {
            let verifier = self.consume_verifier(source_id)?;
            params.push(("code_verifier", verifier));
        }

        let body = self.token_request(settings, params).await?;
        let bundle = parse_token_response(settings, &body)?;
        self.store_bundle(source_id, &bundle)?;
        info!(source = %source_id, "authorization code exchanged");
        Ok(bundle)
    }

    async fn refresh(
        &self,
        source_id: &str,
        settings: &OAuthSettings,
        refresh_token: &str,
    ) -> Result<TokenBundle> {
        let (client_id, client_secret) = self.client_credentials(source_id, settings)?;
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(id) = client_id {
            params.push(("client_id", id));
        }
        if let Some(secret) = client_secret {
            params.push(("client_secret", secret));
        }

        let body = self.token_request(settings, params).await?;
        let mut bundle = parse_token_response(settings, &body)?;
        // Providers that do not rotate refresh tokens omit the field; keep
        // the one we already have.
        if bundle.refresh_token.is_none() {
            bundle.refresh_token = Some(refresh_token.to_string());
        }
        self.store_bundle(source_id, &bundle)?;
        Ok(bundle)
    }

    async fn token_request(
        &self,
        settings: &OAuthSettings,
        params: Vec<(&str, String)>,
    ) -> Result<Value> {
        let request = self.http.post(&settings.token_url);
        let request = match settings.token_request {
            TokenRequestStyle::Form => request.form(&params),
            TokenRequestStyle::Json => {
                let body: serde_json::Map<String, Value> = params
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v)))
                    .collect();
                request.json(&body)
            }
        };

        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .context("token request failed")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read token response")?;
        if !status.is_success() {
            bail!("token endpoint returned {status}: {text}");
        }
        serde_json::from_str(&text).context("token response is not valid JSON")
    }

    fn client_credentials(
        &self,
        source_id: &str,
        settings: &OAuthSettings,
    ) -> Result<(Option<String>, Option<String>)> {
        let client_id = match &settings.client_id {
            Some(id) => Some(id.clone()),
            None => self.secrets.get(source_id, CLIENT_ID_KEY)?,
        };
        let client_secret = match &settings.client_secret {
            Some(secret) => Some(secret.clone()),
            None => self.secrets.get(source_id, CLIENT_SECRET_KEY)?,
        };
        Ok((client_id, client_secret))
    }

    fn consume_verifier(&self, source_id: &str) -> Result<String> {
        let raw = self
            .secrets
            .get(source_id, VERIFIER_KEY)?
            .ok_or_else(|| anyhow!("no pending PKCE verifier for source {source_id}"))?;
        self.secrets.delete(source_id, VERIFIER_KEY)?;
        let stored: StoredVerifier =
            serde_json::from_str(&raw).context("stored verifier is corrupted")?;
        if stored.is_expired() {
            bail!("PKCE verifier expired; restart the authorization");
        }
        Ok(stored.verifier)
    }

    fn load_bundle(&self, source_id: &str) -> Result<Option<TokenBundle>> {
        let Some(raw) = self.secrets.get(source_id, TOKEN_KEY)? else {
            return Ok(None);
        };
        let bundle = serde_json::from_str(&raw).context("stored token bundle is corrupted")?;
        Ok(Some(bundle))
    }

    fn store_bundle(&self, source_id: &str, bundle: &TokenBundle) -> Result<()> {
        let raw = serde_json::to_string(bundle).context("failed to serialize token bundle")?;
        self.secrets.put(source_id, TOKEN_KEY, &raw)
    }
}

fn parse_token_response(settings: &OAuthSettings, body: &Value) -> Result<TokenBundle> {
    let access_token = body
        .get(&settings.token_field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("token response missing field '{}'", settings.token_field))?
        .to_string();
    let refresh_token = body
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    let expires_at = body
        .get("expires_in")
        .and_then(Value::as_i64)
        .map(|secs| Utc::now() + Duration::seconds(secs));
    Ok(TokenBundle {
        access_token,
        refresh_token,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    fn test_manager() -> AuthManager {
        let key = BASE64.encode([0u8; 32]);
        let secrets = Arc::new(SecretsStore::open(":memory:", &key).unwrap());
        AuthManager::new(secrets)
    }

    fn settings(auth_url: &str, token_url: &str) -> OAuthSettings {
        serde_json::from_value(json!({
            "auth_url": auth_url,
            "token_url": token_url,
            "client_id": "cid-123",
            "scopes": ["read:usage"]
        }))
        .unwrap()
    }

    #[test]
    fn test_authorize_url_contains_pkce_challenge() {
        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", "https://id.example.com/token");
        let url = manager.authorize_url("src1", &settings).unwrap();

        assert!(url.starts_with("https://id.example.com/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=cid-123"));
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("scope=read%3Ausage"));
        assert!(url.contains("state=src1"));

        // The verifier was persisted for the exchange step.
        assert!(manager.secrets.get("src1", VERIFIER_KEY).unwrap().is_some());
    }

    #[test]
    fn test_authorize_url_without_pkce() {
        let manager = test_manager();
        let mut settings =
            settings("https://id.example.com/authorize", "https://id.example.com/token");
        settings.supports_pkce = false;
        let url = manager.authorize_url("src1", &settings).unwrap();
        assert!(!url.contains("code_challenge"));
        assert!(manager.secrets.get("src1", VERIFIER_KEY).unwrap().is_none());
    }

    #[test]
    fn test_authorize_url_requires_client_id() {
        let manager = test_manager();
        let mut settings =
            settings("https://id.example.com/authorize", "https://id.example.com/token");
        settings.client_id = None;
        assert!(manager.authorize_url("src1", &settings).is_err());
    }

    #[test]
    fn test_client_id_falls_back_to_secret() {
        let manager = test_manager();
        let mut settings =
            settings("https://id.example.com/authorize", "https://id.example.com/token");
        settings.client_id = None;
        manager.secrets.put("src1", CLIENT_ID_KEY, "stored-cid").unwrap();
        let url = manager.authorize_url("src1", &settings).unwrap();
        assert!(url.contains("client_id=stored-cid"));
    }

    #[tokio::test]
    async fn test_exchange_code_stores_bundle() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "at-1",
                    "refresh_token": "rt-1",
                    "expires_in": 3600
                })
                .to_string(),
            )
            .create_async()
            .await;

        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", &format!("{}/token", server.url()));

        // authorize_url stores the verifier the exchange must consume.
        manager.authorize_url("src1", &settings).unwrap();
        let bundle = manager.exchange_code("src1", &settings, "auth-code").await.unwrap();

        token_mock.assert_async().await;
        assert_eq!(bundle.access_token, "at-1");
        assert_eq!(bundle.refresh_token.as_deref(), Some("rt-1"));
        assert!(bundle.expires_at.is_some());

        // Verifier is single use; bundle is persisted.
        assert!(manager.secrets.get("src1", VERIFIER_KEY).unwrap().is_none());
        assert!(manager.secrets.get("src1", TOKEN_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exchange_without_pending_verifier_fails() {
        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", "https://id.example.com/token");
        assert!(manager.exchange_code("src1", &settings, "code").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_token_refreshes_when_near_expiry() {
        let mut server = mockito::Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": "at-new", "expires_in": 3600}).to_string())
            .create_async()
            .await;

        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", &format!("{}/token", server.url()));

        let stale = TokenBundle {
            access_token: "at-old".into(),
            refresh_token: Some("rt-1".into()),
            expires_at: Some(Utc::now() + Duration::seconds(10)),
        };
        manager.store_bundle("src1", &stale).unwrap();

        let token = manager.resolve_token("src1", &settings).await.unwrap();
        refresh_mock.assert_async().await;
        assert_eq!(token.as_deref(), Some("at-new"));

        // Un-rotated refresh tokens survive the refresh.
        let bundle = manager.load_bundle("src1").unwrap().unwrap();
        assert_eq!(bundle.refresh_token.as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_resolve_token_returns_valid_token_without_network() {
        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", "https://unreachable.invalid/token");
        let bundle = TokenBundle {
            access_token: "at-valid".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::seconds(3600)),
        };
        manager.store_bundle("src1", &bundle).unwrap();
        let token = manager.resolve_token("src1", &settings).await.unwrap();
        assert_eq!(token.as_deref(), Some("at-valid"));
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_reauth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", &format!("{}/token", server.url()));
        let stale = TokenBundle {
            access_token: "at-old".into(),
            refresh_token: Some("rt-revoked".into()),
            expires_at: Some(Utc::now() - Duration::seconds(10)),
        };
        manager.store_bundle("src1", &stale).unwrap();

        let token = manager.resolve_token("src1", &settings).await.unwrap();
        assert!(token.is_none());
        // The dead bundle was dropped so the next run re-authorizes cleanly.
        assert!(manager.secrets.get("src1", TOKEN_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_token_none_when_no_bundle() {
        let manager = test_manager();
        let settings = settings("https://id.example.com/authorize", "https://id.example.com/token");
        assert!(manager.resolve_token("src1", &settings).await.unwrap().is_none());
    }

    #[test]
    fn test_custom_token_field() {
        let mut s = settings("https://a", "https://t");
        s.token_field = "accessToken".to_string();
        let body = json!({"accessToken": "custom", "expires_in": 60});
        let bundle = parse_token_response(&s, &body).unwrap();
        assert_eq!(bundle.access_token, "custom");

        let standard = json!({"access_token": "std"});
        assert!(parse_token_response(&s, &standard).is_err());
    }
}
