//! ES256 signed-claims verification.
//!
//! The provider signs a short-lived JWT whose `request_body_sha256` claim binds
//! the exact bytes delivered. Keys are looked up by the token's `kid`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

use super::key_cache::KeyCache;
use super::{VerificationError, constant_time_eq};

/// Tokens issued this far in the future are still accepted.
const CLOCK_SKEW_SECS: i64 = 60;

/// Source of provider verification keys.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch_key(&self, kid: &str) -> Result<Jwk, VerificationError>;
}

#[derive(Debug, Deserialize)]
struct BodyClaims {
    iat: i64,
    request_body_sha256: String,
}

/// What a successful verification learned about the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub kid: String,
    pub issued_at: i64,
}

#[tracing::instrument(level = "debug", skip_all, fields(provider))]
pub async fn verify_signed_claims(
    provider: &str,
    token: Option<&str>,
    body: &[u8],
    fetcher: &dyn KeyFetcher,
    cache: &KeyCache,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<VerifiedToken, VerificationError> {
    let token = token
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(VerificationError::MissingSignature)?;

    let header =
        jsonwebtoken::decode_header(token).map_err(|_| VerificationError::SignatureMismatch)?;
    if header.alg != Algorithm::ES256 {
        return Err(VerificationError::SignatureMismatch);
    }
    let kid = header.kid.ok_or(VerificationError::SignatureMismatch)?;

    let jwk = match cache.get(provider, &kid, now) {
        Some(jwk) => jwk,
        None => {
            if cache.is_known_missing(provider, &kid, now) {
                return Err(VerificationError::KeyFetchFailed(format!(
                    "no key {kid} (recently missing)"
                )));
            }
            let jwk = match fetcher.fetch_key(&kid).await {
                Ok(jwk) => jwk,
                Err(e) => {
                    tracing::debug!(provider, %kid, error = %e, "verification key unavailable");
                    cache.mark_missing(provider, &kid, now);
                    return Err(match e {
                        VerificationError::KeyFetchFailed(msg) => {
                            VerificationError::KeyFetchFailed(msg)
                        }
                        other => VerificationError::KeyFetchFailed(other.to_string()),
                    });
                }
            };
            cache.insert(provider, &kid, jwk.clone(), now);
            jwk
        }
    };
    let key = DecodingKey::from_jwk(&jwk)
        .map_err(|e| VerificationError::KeyFetchFailed(format!("unusable key {kid}: {e}")))?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = jsonwebtoken::decode::<BodyClaims>(token, &key, &validation)
        .map_err(|_| VerificationError::SignatureMismatch)?;
    let claims = data.claims;

    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let age = now.timestamp() - claims.iat;
    if age > max_age || age < -CLOCK_SKEW_SECS {
        return Err(VerificationError::StaleToken);
    }

    let actual = hex::encode(Sha256::digest(body));
    let claimed = claims.request_body_sha256.trim().to_ascii_lowercase();
    if !constant_time_eq(actual.as_bytes(), claimed.as_bytes()) {
        return Err(VerificationError::BodyHashMismatch);
    }

    Ok(VerifiedToken {
        kid,
        issued_at: claims.iat,
    })
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StaticFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl KeyFetcher for StaticFetcher {
        async fn fetch_key(&self, kid: &str) -> Result<Jwk, VerificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail || kid != "k1" {
                return Err(VerificationError::KeyFetchFailed(format!("no key {kid}")));
            }
            Ok(public_jwk(kid))
        }
    }

    const BODY: &[u8] = br#"{"webhook_type":"TRANSACTIONS","webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-1"}"#;
    const MAX_AGE: Duration = Duration::from_secs(300);

    async fn run(
        token: Option<&str>,
        body: &[u8],
        fetcher: &StaticFetcher,
        cache: &KeyCache,
        now: DateTime<Utc>,
    ) -> Result<VerifiedToken, VerificationError> {
        verify_signed_claims("plaid", token, body, fetcher, cache, MAX_AGE, now).await
    }

    #[tokio::test]
    async fn valid_token_verifies_and_caches_key() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default();
        let now = Utc::now();
        let token = sign("k1", now.timestamp() - 10, BODY);

        let v = run(Some(&token), BODY, &fetcher, &cache, now).await.unwrap();
        assert_eq!(v.kid, "k1");
        run(Some(&token), BODY, &fetcher, &cache, now).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_hash_mismatch_is_reported() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default();
        let now = Utc::now();
        let token = sign("k1", now.timestamp(), BODY);
        let err = run(Some(&token), b"{\"tampered\":true}", &fetcher, &cache, now)
            .await
            .unwrap_err();
        assert_eq!(err, VerificationError::BodyHashMismatch);
    }

    #[tokio::test]
    async fn old_or_future_tokens_are_stale() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default();
        let now = Utc::now();
        let old = sign("k1", now.timestamp() - 301, BODY);
        let future = sign("k1", now.timestamp() + 600, BODY);
        assert_eq!(
            run(Some(&old), BODY, &fetcher, &cache, now).await.unwrap_err(),
            VerificationError::StaleToken
        );
        assert_eq!(
            run(Some(&future), BODY, &fetcher, &cache, now).await.unwrap_err(),
            VerificationError::StaleToken
        );
    }

    #[tokio::test]
    async fn unknown_kid_is_key_fetch_failure() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default();
        let now = Utc::now();
        let token = sign("k9", now.timestamp(), BODY);
        assert!(matches!(
            run(Some(&token), BODY, &fetcher, &cache, now).await,
            Err(VerificationError::KeyFetchFailed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kid_is_not_refetched_until_the_miss_expires() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default().with_miss_ttl(Duration::from_secs(30));
        let now = Utc::now();
        let token = sign("k9", now.timestamp(), BODY);

        for _ in 0..5 {
            assert!(matches!(
                run(Some(&token), BODY, &fetcher, &cache, now).await,
                Err(VerificationError::KeyFetchFailed(_))
            ));
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let later = now + chrono::Duration::seconds(31);
        let token = sign("k9", later.timestamp(), BODY);
        assert!(run(Some(&token), BODY, &fetcher, &cache, later).await.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        // A known kid is unaffected by the miss.
        let good = sign("k1", later.timestamp(), BODY);
        run(Some(&good), BODY, &fetcher, &cache, later).await.unwrap();
    }

    #[tokio::test]
    async fn garbage_and_missing_tokens() {
        let fetcher = StaticFetcher::new();
        let cache = KeyCache::default();
        let now = Utc::now();
        assert_eq!(
            run(None, BODY, &fetcher, &cache, now).await.unwrap_err(),
            VerificationError::MissingSignature
        );
        assert_eq!(
            run(Some("a.b.c"), BODY, &fetcher, &cache, now).await.unwrap_err(),
            VerificationError::SignatureMismatch
        );

        let token = sign("k1", now.timestamp(), BODY);
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let sig = parts[2].clone();
        let flipped = if sig.starts_with('A') { "B" } else { "A" };
        parts[2] = format!("{flipped}{}", &sig[1..]);
        let tampered = parts.join(".");
        assert_eq!(
            run(Some(&tampered), BODY, &fetcher, &cache, now).await.unwrap_err(),
            VerificationError::SignatureMismatch
        );
    }
}
