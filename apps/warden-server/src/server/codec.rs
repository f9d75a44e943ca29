use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Only algorithm the codec will ever sign with or accept. Anything else
/// in a presented header is rejected outright (algorithm confusion).
pub(crate) const TOKEN_ALGORITHM: &str = "HS256";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum CodecError {
    #[error("token format is invalid")]
    InvalidFormat,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token algorithm is not allowed")]
    InvalidAlgorithm,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Claims carried by both token kinds. `typ` is present only on refresh
/// tokens; `email` is optional caller-supplied context for the presence
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub(crate) iss: String,
    pub(crate) sub: String,
    pub(crate) iat: i64,
    pub(crate) exp: i64,
    #[serde(default)]
    pub(crate) scopes: Vec<String>,
    pub(crate) jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
}

impl Claims {
    pub(crate) fn is_refresh(&self) -> bool {
        self.typ.as_deref() == Some("refresh")
    }
}

/// HMAC-SHA256 sign/verify over a `b64(header).b64(payload).b64(sig)`
/// triple. Deliberately self-contained so the format can be swapped
/// without touching the token service above it.
pub(crate) struct TokenCodec {
    key: Vec<u8>,
}

impl TokenCodec {
    pub(crate) fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// # Errors
    /// Fails only when claim serialization or MAC keying fails, which a
    /// well-formed [`Claims`] value never triggers.
    pub(crate) fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let header = serde_json::to_vec(&TokenHeader {
            alg: String::from(TOKEN_ALGORITHM),
        })
        .map_err(|e| anyhow!("header encode failed: {e}"))?;
        let payload =
            serde_json::to_vec(claims).map_err(|e| anyhow!("claims encode failed: {e}"))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow!("mac keying failed: {e}"))?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Recomputes the expected signature and compares in constant time.
    /// The equal-length check short-circuits first: a wrong-length
    /// signature can never be valid, so rejecting it immediately leaks
    /// nothing an attacker does not already know.
    ///
    /// # Errors
    /// [`CodecError::InvalidFormat`] for anything other than three
    /// decodable segments, [`CodecError::InvalidAlgorithm`] for a header
    /// not declaring `HS256`, [`CodecError::InvalidSignature`] on
    /// mismatch.
    pub(crate) fn verify(&self, token: &str) -> Result<Claims, CodecError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(CodecError::InvalidFormat);
        };

        let header_bytes = decode_segment(header_b64)?;
        let header: TokenHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| CodecError::InvalidFormat)?;
        if header.alg != TOKEN_ALGORITHM {
            return Err(CodecError::InvalidAlgorithm);
        }

        // The MAC is always computed over the unpadded form, so a token
        // re-encoded with padding verifies the same as the original.
        let signing_input = format!(
            "{}.{}",
            header_b64.trim_end_matches('='),
            payload_b64.trim_end_matches('=')
        );
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| CodecError::InvalidSignature)?;
        mac.update(signing_input.as_bytes());
        let expected = mac.finalize().into_bytes();

        let provided = decode_segment(signature_b64)?;
        if provided.len() != expected.len() {
            return Err(CodecError::InvalidSignature);
        }
        if !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
            return Err(CodecError::InvalidSignature);
        }

        let payload_bytes = decode_segment(payload_b64)?;
        serde_json::from_slice(&payload_bytes).map_err(|_| CodecError::InvalidFormat)
    }
}

/// Decodes base64url tolerating both padded and unpadded input; encoding
/// always strips padding.
fn decode_segment(segment: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| CodecError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    use super::{Claims, CodecError, TokenCodec};

    fn claims() -> Claims {
        Claims {
            iss: String::from("warden"),
            sub: String::from("user-1"),
            iat: 1_000,
            exp: 2_000,
            scopes: vec![String::from("read:civic")],
            jti: String::from("0123456789abcdef0123456789abcdef"),
            typ: None,
            email: None,
        }
    }

    #[test]
    fn sign_then_verify_round_trips_claims() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let token = codec.sign(&claims()).unwrap();
        let decoded = codec.verify(&token).unwrap();

        assert_eq!(decoded.sub, "user-1");
        assert_eq!(decoded.scopes, vec![String::from("read:civic")]);
        assert_eq!(decoded.exp, 2_000);
    }

    #[test]
    fn wrong_segment_count_is_invalid_format() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        for malformed in ["", "one", "a.b", "a.b.c.d"] {
            assert_eq!(codec.verify(malformed), Err(CodecError::InvalidFormat));
        }
    }

    #[test]
    fn flipping_any_signature_byte_fails_verification() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let token = codec.sign(&claims()).unwrap();
        let (prefix, signature_b64) = token.rsplit_once('.').unwrap();
        let mut signature = URL_SAFE_NO_PAD.decode(signature_b64).unwrap();

        for i in 0..signature.len() {
            signature[i] ^= 0x01;
            let tampered = format!("{prefix}.{}", URL_SAFE_NO_PAD.encode(&signature));
            assert_eq!(
                codec.verify(&tampered),
                Err(CodecError::InvalidSignature),
                "byte {i}"
            );
            signature[i] ^= 0x01;
        }
    }

    #[test]
    fn truncated_signature_short_circuits_on_length() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let token = codec.sign(&claims()).unwrap();
        let (prefix, signature_b64) = token.rsplit_once('.').unwrap();
        let mut signature = URL_SAFE_NO_PAD.decode(signature_b64).unwrap();
        signature.truncate(16);
        let truncated = format!("{prefix}.{}", URL_SAFE_NO_PAD.encode(&signature));
        assert_eq!(codec.verify(&truncated), Err(CodecError::InvalidSignature));
    }

    #[test]
    fn foreign_algorithm_is_rejected_before_signature_check() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let token = codec.sign(&claims()).unwrap();
        let (_, rest) = token.split_once('.').unwrap();
        let forged_header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let forged = format!("{forged_header}.{rest}");
        assert_eq!(codec.verify(&forged), Err(CodecError::InvalidAlgorithm));
    }

    #[test]
    fn verify_tolerates_padded_base64url() {
        let codec = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let token = codec.sign(&claims()).unwrap();
        let mut segments = token.split('.');
        let header = segments.next().unwrap();
        let payload = segments.next().unwrap();
        let signature = segments.next().unwrap();

        let pad = |s: &str| {
            let mut padded = s.to_owned();
            while padded.len() % 4 != 0 {
                padded.push('=');
            }
            padded
        };
        let padded = format!("{}.{}.{}", pad(header), pad(payload), pad(signature));
        assert_ne!(padded, token);
        assert_eq!(codec.verify(&padded), Ok(claims()));
    }

    #[test]
    fn different_keys_do_not_cross_verify() {
        let codec_a = TokenCodec::new(b"0123456789abcdef0123456789abcdef");
        let codec_b = TokenCodec::new(b"fedcba9876543210fedcba9876543210");
        let token = codec_a.sign(&claims()).unwrap();
        assert_eq!(codec_b.verify(&token), Err(CodecError::InvalidSignature));
    }
}
