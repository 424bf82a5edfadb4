//! Inbound webhook verification and ingestion.
//!
//! Two verification modes exist: shared-secret HMAC over the raw body and
//! provider-signed ES256 tokens whose claims bind the body hash. Ingestion sits
//! on top and routes verified deltas into the sync path.

pub mod ingest;
pub mod jwt;
pub mod key_cache;
pub mod signature;
pub mod verifier;

pub use ingest::{IngestError, IngestOutcome, WebhookIngestor};
pub use jwt::KeyFetcher;
pub use key_cache::KeyCache;
pub use verifier::{VerificationMode, WebhookVerifier};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("signature header missing")]
    MissingSignature,

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("request body hash does not match signed claim")]
    BodyHashMismatch,

    #[error("verification key unavailable: {0}")]
    KeyFetchFailed(String),

    #[error("signed token is outside the accepted age window")]
    StaleToken,

    #[error("no verifier configured for provider '{0}'")]
    UnknownProvider(String),
}

/// A delivery as received, before any trust is established.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub provider: String,
    pub event_name: String,
    pub claimed_signature: Option<String>,
    pub raw_body: Vec<u8>,
    pub parsed_payload: serde_json::Value,
}

/// A delivery whose origin has been proven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedEvent {
    pub provider: String,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub verified_at: DateTime<Utc>,
    /// Signing key id for token-verified deliveries.
    pub key_id: Option<String>,
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"xbc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
