use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::VerificationError;

type HmacSha256 = Hmac<Sha256>;

/// Decode a claimed signature given as hex, `sha256=<hex>` or base64.
fn decode_signature(claimed: &str) -> Option<Vec<u8>> {
    let s = claimed.trim();
    let s = s.strip_prefix("sha256=").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(s).ok();
    }
    B64.decode(s).ok()
}

/// Verify `HMAC-SHA256(secret, body)` against the header value.
///
/// Every mismatch, including an undecodable or wrong-length signature, yields
/// the same `SignatureMismatch`.
pub fn verify_hmac_sha256(
    secret: &[u8],
    body: &[u8],
    claimed: Option<&str>,
) -> Result<(), VerificationError> {
    let claimed = claimed
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(VerificationError::MissingSignature)?;
    let Some(sig) = decode_signature(claimed) else {
        return Err(VerificationError::SignatureMismatch);
    };
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| VerificationError::SignatureMismatch)?;
    mac.update(body);
    mac.verify_slice(&sig)
        .map_err(|_| VerificationError::SignatureMismatch)
}

/// Hex digest, for tests and for signing outbound fixtures.
pub fn sign_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"todoist-client-secret";
    const BODY: &[u8] = br#"{"event_name":"item:added","user_id":"42"}"#;

    #[test]
    fn accepts_hex_prefixed_and_base64() {
        let hex_sig = sign_hmac_sha256_hex(SECRET, BODY);
        let b64_sig = B64.encode(hex::decode(&hex_sig).unwrap());
        assert_eq!(verify_hmac_sha256(SECRET, BODY, Some(&hex_sig)), Ok(()));
        assert_eq!(
            verify_hmac_sha256(SECRET, BODY, Some(&format!("sha256={hex_sig}"))),
            Ok(())
        );
        assert_eq!(verify_hmac_sha256(SECRET, BODY, Some(&b64_sig)), Ok(()));
    }

    #[test]
    fn missing_header_is_distinct_from_mismatch() {
        assert_eq!(
            verify_hmac_sha256(SECRET, BODY, None),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_hmac_sha256(SECRET, BODY, Some("  ")),
            Err(VerificationError::MissingSignature)
        );
    }

    #[test]
    fn mismatch_position_does_not_change_the_error() {
        let good = hex::decode(sign_hmac_sha256_hex(SECRET, BODY)).unwrap();
        for pos in [0, good.len() / 2, good.len() - 1] {
            let mut bad = good.clone();
            bad[pos] ^= 0x80;
            assert_eq!(
                verify_hmac_sha256(SECRET, BODY, Some(&hex::encode(&bad))),
                Err(VerificationError::SignatureMismatch),
                "flip at byte {pos}"
            );
        }
        assert_eq!(
            verify_hmac_sha256(SECRET, BODY, Some(&hex::encode(&good[..16]))),
            Err(VerificationError::SignatureMismatch)
        );
        assert_eq!(
            verify_hmac_sha256(SECRET, BODY, Some("not a signature!")),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn tampered_body_fails() {
        let sig = sign_hmac_sha256_hex(SECRET, BODY);
        assert_eq!(
            verify_hmac_sha256(SECRET, b"{}", Some(&sig)),
            Err(VerificationError::SignatureMismatch)
        );
    }
}
