use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{
    rngs::{StdRng, SysRng},
    Rng, SeedableRng,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use warden_core::{validate_scope_list, SubjectId};

use super::{
    audit::record_audit,
    codec::{Claims, CodecError, TokenCodec},
    core::{AppState, MAX_TOKEN_CHARS, MIN_TOKEN_CHARS, TOKEN_ISSUER},
    errors::ServiceFailure,
    store::{RedeemOutcome, RefreshRecord},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum TokenError {
    #[error("token format is invalid")]
    InvalidFormat,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token algorithm is not allowed")]
    InvalidAlgorithm,
    #[error("token is expired")]
    Expired,
    #[error("token is revoked")]
    Revoked,
    #[error("wrong token type for this operation")]
    WrongTokenType,
    #[error("refresh token was already redeemed")]
    AlreadyUsed,
    #[error("refresh token is unknown")]
    Unknown,
}

impl From<CodecError> for TokenError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::InvalidFormat => Self::InvalidFormat,
            CodecError::InvalidSignature => Self::InvalidSignature,
            CodecError::InvalidAlgorithm => Self::InvalidAlgorithm,
        }
    }
}

impl From<TokenError> for ServiceFailure {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::InvalidFormat
            | TokenError::InvalidSignature
            | TokenError::InvalidAlgorithm
            | TokenError::Unknown => Self::InvalidToken,
            TokenError::Expired => Self::Expired,
            TokenError::Revoked => Self::Revoked,
            TokenError::WrongTokenType => Self::WrongTokenType,
            TokenError::AlreadyUsed => Self::AlreadyUsed,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IssuedToken {
    pub(crate) token: String,
    pub(crate) expires_in_secs: i64,
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

/// Full SHA-256 of the token string. Used as the storage key for the
/// blacklist and refresh records; the raw token is never persisted.
pub(crate) fn token_hash_hex(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Truncated, non-reversible token reference safe for audit and logs.
pub(crate) fn token_fingerprint(token: &str) -> String {
    let mut hash = token_hash_hex(token);
    hash.truncate(12);
    hash
}

fn random_token_id() -> String {
    let mut bytes = [0_u8; 16];
    StdRng::try_from_rng(&mut SysRng)
        .expect("OS entropy source unavailable")
        .fill_bytes(&mut bytes);
    format!("{:032x}", u128::from_be_bytes(bytes))
}

fn codec(state: &AppState) -> TokenCodec {
    TokenCodec::new(&state.signing_key)
}

/// Cheap shape check before any signature work: bounds and printable
/// ASCII only.
fn validate_token_shape(token: &str) -> Result<(), TokenError> {
    if token.len() < MIN_TOKEN_CHARS || token.len() > MAX_TOKEN_CHARS {
        return Err(TokenError::InvalidFormat);
    }
    if token.bytes().all(|b| b.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(TokenError::InvalidFormat)
    }
}

fn validate_issue_request(user_id: &str, scopes: &[String]) -> Result<(), ServiceFailure> {
    SubjectId::try_from(user_id.to_owned()).map_err(|_| ServiceFailure::InvalidRequest)?;
    validate_scope_list(scopes).map_err(|_| ServiceFailure::InvalidRequest)?;
    Ok(())
}

/// Expiry check with the configured clock-skew leeway. A token is valid
/// strictly while `now < exp + leeway`; at zero leeway `exp == now` is
/// already expired.
pub(crate) fn check_expiry(exp: i64, now: i64, leeway_secs: i64) -> Result<(), TokenError> {
    if now >= exp.saturating_add(leeway_secs) {
        Err(TokenError::Expired)
    } else {
        Ok(())
    }
}

pub(crate) async fn issue_access_token(
    state: &AppState,
    user_id: &str,
    scopes: &[String],
    email: Option<String>,
) -> Result<IssuedToken, ServiceFailure> {
    validate_issue_request(user_id, scopes)?;

    let now = now_unix();
    let ttl = state.runtime.access_token_ttl_secs;
    let claims = Claims {
        iss: String::from(TOKEN_ISSUER),
        sub: user_id.to_owned(),
        iat: now,
        exp: now + ttl,
        scopes: scopes.to_vec(),
        jti: random_token_id(),
        typ: None,
        email,
    };
    let token = codec(state).sign(&claims).map_err(|e| {
        tracing::error!(error = %e, "access token mint failed");
        ServiceFailure::Internal
    })?;

    record_audit(
        state,
        user_id,
        "token.issue_access",
        "granted",
        Some(json!({ "token": token_fingerprint(&token), "scopes": scopes })),
    )
    .await;

    Ok(IssuedToken {
        token,
        expires_in_secs: ttl,
    })
}

pub(crate) async fn issue_refresh_token(
    state: &AppState,
    user_id: &str,
    scopes: &[String],
    email: Option<String>,
) -> Result<IssuedToken, ServiceFailure> {
    validate_issue_request(user_id, scopes)?;

    let now = now_unix();
    let ttl = state.runtime.refresh_token_ttl_secs;
    let claims = Claims {
        iss: String::from(TOKEN_ISSUER),
        sub: user_id.to_owned(),
        iat: now,
        exp: now + ttl,
        scopes: scopes.to_vec(),
        jti: random_token_id(),
        typ: Some(String::from("refresh")),
        email,
    };
    let token = codec(state).sign(&claims).map_err(|e| {
        tracing::error!(error = %e, "refresh token mint failed");
        ServiceFailure::Internal
    })?;

    state
        .store
        .put_refresh(
            &token_hash_hex(&token),
            RefreshRecord {
                user_id: user_id.to_owned(),
                scopes: scopes.to_vec(),
                expires_at_unix: now + ttl,
            },
        )
        .await;

    record_audit(
        state,
        user_id,
        "token.issue_refresh",
        "granted",
        Some(json!({ "token": token_fingerprint(&token) })),
    )
    .await;

    Ok(IssuedToken {
        token,
        expires_in_secs: ttl,
    })
}

/// Check order is fixed: shape, signature, revocation, token type,
/// expiry. Partial decode results from a failed step are discarded.
pub(crate) async fn verify_access_token(
    state: &AppState,
    token: &str,
) -> Result<Claims, TokenError> {
    validate_token_shape(token)?;
    let claims = codec(state).verify(token)?;

    if state.store.is_revoked(&token_hash_hex(token)).await {
        record_audit(
            state,
            &claims.sub,
            "token.verify",
            "denied",
            Some(json!({ "token": token_fingerprint(token), "reason": "revoked" })),
        )
        .await;
        return Err(TokenError::Revoked);
    }
    if claims.is_refresh() {
        return Err(TokenError::WrongTokenType);
    }
    check_expiry(claims.exp, now_unix(), state.runtime.clock_skew_secs)?;
    Ok(claims)
}

/// Redeems a refresh token for one fresh access token. Single-hop by
/// design: the refresh token itself is spent and never reissued, so a
/// caller must authenticate again once it is gone.
pub(crate) async fn refresh_access_token(
    state: &AppState,
    refresh_token: &str,
) -> Result<IssuedToken, ServiceFailure> {
    validate_token_shape(refresh_token).map_err(ServiceFailure::from)?;
    let claims = codec(state)
        .verify(refresh_token)
        .map_err(|e| ServiceFailure::from(TokenError::from(e)))?;
    if !claims.is_refresh() {
        return Err(ServiceFailure::WrongTokenType);
    }

    let hash = token_hash_hex(refresh_token);
    if state.store.is_revoked(&hash).await {
        return Err(ServiceFailure::Revoked);
    }
    let now = now_unix();
    check_expiry(claims.exp, now, state.runtime.clock_skew_secs).map_err(ServiceFailure::from)?;

    match state.store.redeem_refresh(&hash, now).await {
        RedeemOutcome::Redeemed(record) => {
            record_audit(
                state,
                &record.user_id,
                "token.refresh",
                "granted",
                Some(json!({ "token": token_fingerprint(refresh_token) })),
            )
            .await;
            issue_access_token(state, &record.user_id, &record.scopes, claims.email).await
        }
        RedeemOutcome::AlreadyUsed => {
            record_audit(
                state,
                &claims.sub,
                "token.refresh",
                "denied",
                Some(json!({ "token": token_fingerprint(refresh_token), "reason": "replay" })),
            )
            .await;
            Err(ServiceFailure::from(TokenError::AlreadyUsed))
        }
        RedeemOutcome::Unknown => Err(ServiceFailure::from(TokenError::Unknown)),
    }
}

/// Blacklists a token until its own expiry. Idempotent; works for both
/// token kinds, including ones that have already expired.
pub(crate) async fn revoke_token(state: &AppState, token: &str) -> Result<(), ServiceFailure> {
    validate_token_shape(token).map_err(ServiceFailure::from)?;
    let claims = codec(state)
        .verify(token)
        .map_err(|e| ServiceFailure::from(TokenError::from(e)))?;

    state.store.revoke(&token_hash_hex(token), claims.exp).await;
    record_audit(
        state,
        &claims.sub,
        "token.revoke",
        "granted",
        Some(json!({ "token": token_fingerprint(token) })),
    )
    .await;
    Ok(())
}
