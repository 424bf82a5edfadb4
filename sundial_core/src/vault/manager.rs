use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Credential, CredentialVault};
use crate::models::UserId;
use crate::store::CredentialStore;
use crate::{Error, Result};

/// Non-secret view of a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedProvider {
    pub provider: String,
    pub rotated_at: DateTime<Utc>,
    pub external_account_id: Option<String>,
}

/// Encrypted provider credentials keyed by `(owner, provider)`.
///
/// Secrets are JSON documents (tokens, refresh tokens, expiry) sealed as a whole.
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    vault: CredentialVault,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, vault: CredentialVault) -> Self {
        Self { store, vault }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    fn seal(
        &self,
        owner_id: UserId,
        provider: &str,
        secret: &serde_json::Value,
        external_account_id: Option<String>,
    ) -> Result<Credential> {
        let plaintext = serde_json::to_vec(secret)
            .map_err(|e| Error::BackendMessage(format!("serialize credential: {e}")))?;
        let sealed = self.vault.seal(&plaintext)?;
        Ok(Credential {
            owner_id,
            provider: provider.to_string(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            auth_tag: sealed.tag.to_vec(),
            rotated_at: Utc::now(),
            external_account_id,
        })
    }

    /// Encrypt and persist, replacing any existing secret for this provider.
    #[tracing::instrument(level = "info", skip(self, secret))]
    pub async fn store(
        &self,
        owner_id: UserId,
        provider: &str,
        secret: &serde_json::Value,
        external_account_id: Option<&str>,
    ) -> Result<()> {
        if provider.trim().is_empty() {
            return Err(Error::InvalidInput("provider is empty".to_string()));
        }
        if let Some(account) = external_account_id {
            // Webhooks are routed by account id; it must map to exactly one user.
            match self.find_owner(provider, account).await? {
                Some(existing) if existing != owner_id => {
                    tracing::warn!(provider, "external account already linked to another user");
                    return Err(Error::Conflict(format!(
                        "{provider} account is already linked to another user"
                    )));
                }
                _ => {}
            }
        }
        let credential = self.seal(
            owner_id,
            provider,
            secret,
            external_account_id.map(str::to_string),
        )?;
        self.store.upsert_credential(&credential).await
    }

    /// Decrypt the stored secret. A row that fails authentication is an error,
    /// never an empty secret.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve(
        &self,
        owner_id: UserId,
        provider: &str,
    ) -> Result<Option<serde_json::Value>> {
        let Some(credential) = self.store.get_credential(owner_id, provider).await? else {
            return Ok(None);
        };
        let plaintext = self.vault.open(&credential.sealed()?)?;
        let value = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::BackendMessage(format!("deserialize credential: {e}")))?;
        Ok(Some(value))
    }

    /// Re-seal a refreshed secret, keeping the linked account id.
    #[tracing::instrument(level = "debug", skip(self, secret))]
    pub async fn rotate(
        &self,
        owner_id: UserId,
        provider: &str,
        secret: &serde_json::Value,
    ) -> Result<()> {
        let existing = self
            .store
            .get_credential(owner_id, provider)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no {provider} credential for {owner_id}")))?;
        let credential = self.seal(owner_id, provider, secret, existing.external_account_id)?;
        self.store.upsert_credential(&credential).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete(&self, owner_id: UserId, provider: &str) -> Result<bool> {
        self.store.delete_credential(owner_id, provider).await
    }

    pub async fn list_providers(&self, owner_id: UserId) -> Result<Vec<String>> {
        Ok(self
            .list(owner_id)
            .await?
            .into_iter()
            .map(|p| p.provider)
            .collect())
    }

    pub async fn list(&self, owner_id: UserId) -> Result<Vec<LinkedProvider>> {
        let creds = self.store.list_credentials(owner_id).await?;
        Ok(creds
            .into_iter()
            .map(|c| LinkedProvider {
                provider: c.provider,
                rotated_at: c.rotated_at,
                external_account_id: c.external_account_id,
            })
            .collect())
    }

    pub async fn find_owner(
        &self,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<UserId>> {
        self.store
            .find_credential_owner(provider, external_account_id)
            .await
    }

    pub async fn linked_users(&self) -> Result<Vec<UserId>> {
        self.store.list_credential_owners().await
    }
}
