#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "warden"
}

/// Scope granting every capability.
pub const WILDCARD_SCOPE: &str = "*";

/// Upper bound on scopes carried by a single token.
pub const MAX_SCOPES_PER_TOKEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("subject id is invalid")]
    InvalidSubjectId,
    #[error("scope is invalid")]
    InvalidScope,
    #[error("scope list is invalid")]
    InvalidScopeList,
    #[error("room id is invalid")]
    InvalidRoomId,
    #[error("connection id is invalid")]
    InvalidConnectionId,
}

/// Opaque subject identifier minted by an external identity source.
///
/// The sidecar never generates these, so the format is deliberately loose:
/// bounded length and a conservative character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_subject_id(&value)?;
        Ok(Self(value))
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.0
    }
}

impl core::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability tag checked against a token's granted set, e.g. `read:civic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_SCOPE
    }
}

impl TryFrom<String> for Scope {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_scope(&value)?;
        Ok(Self(value))
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.0
    }
}

/// Validates a caller-supplied scope list before any cryptographic work.
///
/// # Errors
/// Returns [`DomainError`] when the list exceeds [`MAX_SCOPES_PER_TOKEN`]
/// or any entry fails [`validate_scope`].
pub fn validate_scope_list(scopes: &[String]) -> Result<(), DomainError> {
    if scopes.len() > MAX_SCOPES_PER_TOKEN {
        return Err(DomainError::InvalidScopeList);
    }
    for scope in scopes {
        validate_scope(scope)?;
    }
    Ok(())
}

/// Logical fan-out target. Membership is independent of any connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_room_id(&value)?;
        Ok(Self(value))
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl core::fmt::Display for RoomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique handle for one live event stream. One subject may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidConnectionId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_subject_id(value: &str) -> Result<(), DomainError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(DomainError::InvalidSubjectId);
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '@'));
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidSubjectId)
    }
}

fn validate_scope(value: &str) -> Result<(), DomainError> {
    const MAX_LEN: usize = 64;

    if value == WILDCARD_SCOPE {
        return Ok(());
    }
    if value.is_empty() || value.len() > MAX_LEN {
        return Err(DomainError::InvalidScope);
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | ':'));
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidScope)
    }
}

fn validate_room_id(value: &str) -> Result<(), DomainError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(DomainError::InvalidRoomId);
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidRoomId)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        validate_scope_list, ConnectionId, DomainError, RoomId, Scope, SubjectId,
        MAX_SCOPES_PER_TOKEN, WILDCARD_SCOPE,
    };

    #[test]
    fn accepts_plausible_subject_ids() {
        for value in ["user-42", "a", "svc:web.app@prod", "01J0ABCDEF"] {
            assert!(SubjectId::try_from(value.to_owned()).is_ok(), "{value}");
        }
    }

    #[test]
    fn rejects_empty_oversized_and_exotic_subject_ids() {
        assert_eq!(
            SubjectId::try_from(String::new()),
            Err(DomainError::InvalidSubjectId)
        );
        assert_eq!(
            SubjectId::try_from("x".repeat(65)),
            Err(DomainError::InvalidSubjectId)
        );
        assert_eq!(
            SubjectId::try_from("user id".to_owned()),
            Err(DomainError::InvalidSubjectId)
        );
    }

    #[test]
    fn scope_charset_is_lowercase_digits_underscore_colon() {
        assert!(Scope::try_from("read:civic".to_owned()).is_ok());
        assert!(Scope::try_from("realtime:connect".to_owned()).is_ok());
        assert_eq!(
            Scope::try_from("Read:Civic".to_owned()),
            Err(DomainError::InvalidScope)
        );
        assert_eq!(
            Scope::try_from("read civic".to_owned()),
            Err(DomainError::InvalidScope)
        );
    }

    #[test]
    fn wildcard_scope_is_valid_and_flagged() {
        let scope = Scope::try_from(WILDCARD_SCOPE.to_owned()).expect("wildcard parses");
        assert!(scope.is_wildcard());
        assert!(!Scope::try_from("read:civic".to_owned())
            .expect("scope parses")
            .is_wildcard());
    }

    #[test]
    fn scope_list_is_bounded() {
        let oversized: Vec<String> = (0..=MAX_SCOPES_PER_TOKEN)
            .map(|i| format!("scope_{i}"))
            .collect();
        assert_eq!(
            validate_scope_list(&oversized),
            Err(DomainError::InvalidScopeList)
        );
        assert!(validate_scope_list(&[String::from("read:civic")]).is_ok());
    }

    #[test]
    fn room_id_allows_alphanumeric_dash_underscore() {
        assert!(RoomId::try_from("help-requests".to_owned()).is_ok());
        assert_eq!(
            RoomId::try_from("rooms/../etc".to_owned()),
            Err(DomainError::InvalidRoomId)
        );
    }

    #[test]
    fn connection_ids_round_trip_through_display() {
        let id = ConnectionId::new();
        let parsed = ConnectionId::try_from(id.to_string()).expect("ulid parses back");
        assert_eq!(id, parsed);
    }
}
