//! Provider credential resolution.
//!
//! The order is load-bearing and test-visible: explicit config override,
//! then a stored provider key, then an OAuth access token (refreshed
//! transparently when expired) for providers that support OAuth, then the
//! conventional environment variable, then failure. Changing this order
//! changes user-observable behaviour.

use crate::config::ProviderConfig;
use crate::errors::{PryxError, PryxResult};
use crate::vault::{SecretScope, Vault};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Vault names used under the OAuth scope for provider `p`:
/// `p/access`, `p/refresh`, `p/expires_at` (epoch millis, ASCII).
fn oauth_name(provider: &str, part: &str) -> String {
    format!("{provider}/{part}")
}

pub struct CredentialResolver {
    vault: Arc<Vault>,
    http: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the credential for a provider, walking the fallback chain.
    pub async fn resolve(&self, provider: &str, cfg: &ProviderConfig) -> PryxResult<Credential> {
        // 1. Explicit override from config.
        if !cfg.api_key.is_empty() {
            debug!("{provider}: using explicit key override");
            return Ok(Credential::ApiKey(cfg.api_key.clone()));
        }

        // 2. Stored provider key.
        if let Some(bytes) = self
            .vault
            .read_opt(SecretScope::ProviderKey, provider)
            .await?
        {
            debug!("{provider}: using stored provider key");
            return Ok(Credential::ApiKey(String::from_utf8_lossy(&bytes).into_owned()));
        }

        // 3. OAuth access token, refreshed before first use if expired.
        if cfg.oauth
            && let Some(token) = self.resolve_oauth(provider).await?
        {
            debug!("{provider}: using OAuth access token");
            return Ok(Credential::OauthToken(token));
        }

        // 4. Conventional environment variable.
        let env_var = format!("{}_API_KEY", provider.to_uppercase());
        if let Ok(value) = std::env::var(&env_var)
            && !value.is_empty()
        {
            debug!("{provider}: using {env_var}");
            return Ok(Credential::ApiKey(value));
        }

        Err(PryxError::Auth(format!(
            "no credential for provider '{provider}' (checked config, vault, oauth, {env_var})"
        )))
    }

    async fn resolve_oauth(&self, provider: &str) -> PryxResult<Option<String>> {
        let access = self
            .vault
            .read_opt(SecretScope::OauthToken, &oauth_name(provider, "access"))
            .await?;
        let Some(access) = access else {
            return Ok(None);
        };
        let access = String::from_utf8_lossy(&access).into_owned();

        let expires_at = self
            .vault
            .read_opt(SecretScope::OauthToken, &oauth_name(provider, "expires_at"))
            .await?
            .and_then(|b| String::from_utf8_lossy(&b).trim().parse::<i64>().ok())
            .unwrap_or(0);

        let now_ms = Utc::now().timestamp_millis();
        if expires_at == 0 || now_ms < expires_at {
            return Ok(Some(access));
        }

        info!("{provider}: OAuth token expired, refreshing");
        match self.refresh_oauth(provider).await {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("{provider}: token refresh failed: {e}, using existing token");
                Ok(Some(access))
            }
        }
    }

    async fn refresh_oauth(&self, provider: &str) -> PryxResult<String> {
        let refresh = self
            .vault
            .read_opt(SecretScope::OauthToken, &oauth_name(provider, "refresh"))
            .await?
            .ok_or_else(|| PryxError::Auth(format!("{provider}: no refresh token stored")))?;
        let refresh = String::from_utf8_lossy(&refresh).into_owned();

        let payload = json!({
            "grant_type": "refresh_token",
            "client_id": OAUTH_CLIENT_ID,
            "refresh_token": refresh,
        });
        let resp = self
            .http
            .post(OAUTH_TOKEN_URL)
            .timeout(OAUTH_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PryxError::Provider {
                message: format!("OAuth refresh request failed: {e}"),
                retryable: true,
            })?;
        if !resp.status().is_success() {
            return Err(PryxError::Auth(format!(
                "OAuth refresh rejected with status {}",
                resp.status()
            )));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| PryxError::Provider {
            message: format!("OAuth refresh response unreadable: {e}"),
            retryable: false,
        })?;
        let access = data["access_token"]
            .as_str()
            .ok_or_else(|| PryxError::Auth("missing access_token in refresh response".into()))?
            .to_string();

        // Persist the rotated tokens before returning.
        self.vault
            .write(
                SecretScope::OauthToken,
                &oauth_name(provider, "access"),
                access.as_bytes(),
            )
            .await?;
        if let Some(new_refresh) = data["refresh_token"].as_str() {
            self.vault
                .write(
                    SecretScope::OauthToken,
                    &oauth_name(provider, "refresh"),
                    new_refresh.as_bytes(),
                )
                .await?;
        }
        if let Some(expires_in) = data["expires_in"].as_i64() {
            let expires_at = Utc::now().timestamp_millis() + expires_in * 1000;
            self.vault
                .write(
                    SecretScope::OauthToken,
                    &oauth_name(provider, "expires_at"),
                    expires_at.to_string().as_bytes(),
                )
                .await?;
        }
        info!("{provider}: OAuth token refreshed");
        Ok(access)
    }
}

/// A resolved credential, tagged with how it authenticates.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(String),
    OauthToken(String),
}

impl Credential {
    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(s) | Credential::OauthToken(s) => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychain;
    use crate::store::Store;
    use crate::vault::AuditLog;

    async fn make_resolver() -> (tempfile::TempDir, Arc<Vault>, CredentialResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("pryx.db")).unwrap());
        let audit = AuditLog::start(store).unwrap();
        let vault = Arc::new(Vault::new(Arc::new(MemoryKeychain::new()), audit));
        let resolver = CredentialResolver::new(vault.clone());
        (dir, vault, resolver)
    }

    #[tokio::test]
    async fn explicit_override_wins_over_vault() {
        let (_dir, vault, resolver) = make_resolver().await;
        vault
            .write(SecretScope::ProviderKey, "anthropic", b"sk-vault")
            .await
            .unwrap();
        let cfg = ProviderConfig {
            api_key: "sk-explicit".into(),
            base_url: None,
            oauth: true,
        };
        let cred = resolver.resolve("anthropic", &cfg).await.unwrap();
        assert_eq!(cred.secret(), "sk-explicit");
    }

    #[tokio::test]
    async fn vault_key_wins_over_oauth() {
        let (_dir, vault, resolver) = make_resolver().await;
        vault
            .write(SecretScope::ProviderKey, "anthropic", b"sk-vault")
            .await
            .unwrap();
        vault
            .write(SecretScope::OauthToken, "anthropic/access", b"oat-token")
            .await
            .unwrap();
        let cfg = ProviderConfig {
            api_key: String::new(),
            base_url: None,
            oauth: true,
        };
        let cred = resolver.resolve("anthropic", &cfg).await.unwrap();
        assert_eq!(cred.secret(), "sk-vault");
    }

    #[tokio::test]
    async fn unexpired_oauth_token_used_without_refresh() {
        let (_dir, vault, resolver) = make_resolver().await;
        vault
            .write(SecretScope::OauthToken, "anthropic/access", b"oat-token")
            .await
            .unwrap();
        let future = (Utc::now().timestamp_millis() + 3_600_000).to_string();
        vault
            .write(
                SecretScope::OauthToken,
                "anthropic/expires_at",
                future.as_bytes(),
            )
            .await
            .unwrap();
        let cfg = ProviderConfig {
            api_key: String::new(),
            base_url: None,
            oauth: true,
        };
        let cred = resolver.resolve("anthropic", &cfg).await.unwrap();
        assert!(matches!(cred, Credential::OauthToken(ref t) if t == "oat-token"));
    }

    #[tokio::test]
    async fn missing_everything_is_auth_error() {
        let (_dir, _vault, resolver) = make_resolver().await;
        let cfg = ProviderConfig::default();
        // Use a provider name nothing in the environment would define.
        let err = resolver.resolve("nonexistent-provider", &cfg).await.unwrap_err();
        assert_eq!(err.code(), "auth.invalid");
    }
}
