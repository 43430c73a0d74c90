//! Scoped secret access over the keychain, with every operation audited.
//!
//! Each secret is stored under a scope-qualified key. Callers must declare
//! the scope they intend; asking for a secret that exists under a different
//! scope is refused and the refusal itself is audited.

pub mod audit;

pub use audit::{AuditEntry, AuditLog, ChainStatus, verify_chain};

use crate::errors::{PryxError, PryxResult};
use crate::keychain::Keychain;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretScope {
    ProviderKey,
    OauthToken,
    ChannelToken,
    SkillSecret,
}

impl SecretScope {
    pub fn as_str(self) -> &'static str {
        match self {
            SecretScope::ProviderKey => "provider-key",
            SecretScope::OauthToken => "oauth-token",
            SecretScope::ChannelToken => "channel-token",
            SecretScope::SkillSecret => "skill-secret",
        }
    }

    fn all() -> [SecretScope; 4] {
        [
            SecretScope::ProviderKey,
            SecretScope::OauthToken,
            SecretScope::ChannelToken,
            SecretScope::SkillSecret,
        ]
    }
}

pub struct Vault {
    keychain: Arc<dyn Keychain>,
    audit: AuditLog,
}

impl Vault {
    pub fn new(keychain: Arc<dyn Keychain>, audit: AuditLog) -> Self {
        Self { keychain, audit }
    }

    fn qualified(scope: SecretScope, name: &str) -> String {
        format!("{}/{}", scope.as_str(), name)
    }

    pub async fn read(&self, scope: SecretScope, name: &str) -> PryxResult<Vec<u8>> {
        match self.keychain.get(&Self::qualified(scope, name))? {
            Some(bytes) => {
                self.audit
                    .record(AuditEntry {
                        actor: "vault".into(),
                        action: "vault.read".into(),
                        target: Self::qualified(scope, name),
                        metadata: json!({}),
                    })
                    .await;
                Ok(bytes)
            }
            None => {
                // Distinguish "absent" from "present under another scope":
                // the latter is a scope violation, refused and audited.
                for other in SecretScope::all() {
                    if other == scope {
                        continue;
                    }
                    if self
                        .keychain
                        .get(&Self::qualified(other, name))?
                        .is_some()
                    {
                        warn!(
                            "vault scope mismatch: {} requested as {}, stored as {}",
                            name,
                            scope.as_str(),
                            other.as_str()
                        );
                        self.audit
                            .record(AuditEntry {
                                actor: "vault".into(),
                                action: "vault.scope_mismatch".into(),
                                target: Self::qualified(scope, name),
                                metadata: json!({ "stored_scope": other.as_str() }),
                            })
                            .await;
                        return Err(PryxError::Auth(format!(
                            "secret '{name}' exists under a different scope"
                        )));
                    }
                }
                Err(PryxError::Auth(format!("secret '{name}' not found")))
            }
        }
    }

    /// Like [`read`](Self::read) but treats absence as `None` rather than an
    /// error. Scope mismatches still refuse.
    pub async fn read_opt(&self, scope: SecretScope, name: &str) -> PryxResult<Option<Vec<u8>>> {
        match self.read(scope, name).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(PryxError::Auth(msg)) if msg.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, scope: SecretScope, name: &str, bytes: &[u8]) -> PryxResult<()> {
        self.keychain.set(&Self::qualified(scope, name), bytes)?;
        self.audit
            .record(AuditEntry {
                actor: "vault".into(),
                action: "vault.write".into(),
                target: Self::qualified(scope, name),
                metadata: json!({ "bytes": bytes.len() }),
            })
            .await;
        Ok(())
    }

    pub async fn delete(&self, scope: SecretScope, name: &str) -> PryxResult<()> {
        self.keychain.delete(&Self::qualified(scope, name))?;
        self.audit
            .record(AuditEntry {
                actor: "vault".into(),
                action: "vault.delete".into(),
                target: Self::qualified(scope, name),
                metadata: json!({}),
            })
            .await;
        Ok(())
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }
}
