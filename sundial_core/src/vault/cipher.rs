use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;

use super::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Output of one `seal` call. Every call draws a fresh random nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedSecret {
    /// `base64(nonce || tag || ciphertext)`.
    pub fn to_blob(&self) -> String {
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        B64.encode(out)
    }

    pub fn from_blob(blob: &str) -> Result<Self, CryptoError> {
        let bytes = B64
            .decode(blob.trim())
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let (nonce, rest) = bytes.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);
        let mut t = [0u8; TAG_LEN];
        t.copy_from_slice(tag);
        Ok(Self {
            nonce: n,
            tag: t,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM sealing keyed by a single process-wide master key.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build from configured key material: 32 bytes as base64 or as 64 hex chars.
    pub fn from_key_material(material: Option<&str>) -> Result<Self, CryptoError> {
        let material = material
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(CryptoError::KeyMissing)?;

        let bytes = if material.len() == KEY_LEN * 2
            && material.chars().all(|c| c.is_ascii_hexdigit())
        {
            hex::decode(material).map_err(|e| CryptoError::KeyMalformed(e.to_string()))?
        } else {
            B64.decode(material)
                .map_err(|e| CryptoError::KeyMalformed(format!("not base64 or hex: {e}")))?
        };

        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::KeyMalformed(format!(
                "expected {KEY_LEN} bytes after decoding, got {}",
                bytes.len()
            ))
        })?;
        Self::from_bytes(&key)
    }

    pub fn from_bytes(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::KeyMalformed(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Fresh random key, base64 encoded, suitable for `SUNDIAL_MASTER_KEY`.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        B64.encode(key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedSecret, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        let mut t = [0u8; TAG_LEN];
        t.copy_from_slice(tag.as_slice());
        Ok(SealedSecret {
            nonce,
            tag: t,
            ciphertext: buffer,
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = sealed.ciphertext.clone();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(buffer)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(self.seal(plaintext.as_bytes())?.to_blob())
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let sealed = SealedSecret::from_blob(blob)?;
        let plaintext = self.open(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::AuthenticationFailed)
    }
}
