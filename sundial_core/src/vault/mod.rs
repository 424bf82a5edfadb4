//! Credential vault: AES-256-GCM sealing of provider secrets at rest.
//!
//! `CredentialVault` owns the master key and does the cryptography.
//! `CredentialManager` pairs it with a `CredentialStore` and speaks in terms of
//! owners and providers.

pub mod cipher;
pub mod manager;

pub use cipher::{CredentialVault, SealedSecret, NONCE_LEN, TAG_LEN};
pub use manager::{CredentialManager, LinkedProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::UserId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("master key is not configured")]
    KeyMissing,

    #[error("master key is malformed: {0}")]
    KeyMalformed(String),

    /// Wrong key, tampered ciphertext or a blob that is not a sealed secret.
    #[error("ciphertext failed authentication")]
    AuthenticationFailed,
}

/// An encrypted provider secret as persisted, one row per `(owner_id, provider)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub owner_id: UserId,
    pub provider: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub rotated_at: DateTime<Utc>,
    pub external_account_id: Option<String>,
}

impl Credential {
    /// Reassemble the sealed parts. Rows whose nonce or tag have the wrong
    /// length are treated as unreadable.
    pub fn sealed(&self) -> Result<SealedSecret, CryptoError> {
        let nonce: [u8; NONCE_LEN] = self
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        let tag: [u8; TAG_LEN] = self
            .auth_tag
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(SealedSecret {
            nonce,
            tag,
            ciphertext: self.ciphertext.clone(),
        })
    }
}
