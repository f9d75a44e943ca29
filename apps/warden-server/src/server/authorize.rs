use warden_core::WILDCARD_SCOPE;

use super::{codec::Claims, errors::ServiceFailure};

/// Verified identity attached to one request: the token's subject and its
/// granted scope set. Built only from claims that already passed
/// signature, revocation, type, and expiry checks.
#[derive(Debug, Clone)]
pub(crate) struct ScopeContext {
    pub(crate) subject: String,
    pub(crate) scopes: Vec<String>,
}

impl From<&Claims> for ScopeContext {
    fn from(claims: &Claims) -> Self {
        Self {
            subject: claims.sub.clone(),
            scopes: claims.scopes.clone(),
        }
    }
}

/// Grants when the context holds `scope` or the wildcard.
///
/// # Errors
/// `Forbidden` otherwise. Gateways call this before any side effect.
pub(crate) fn require(context: &ScopeContext, scope: &str) -> Result<(), ServiceFailure> {
    let granted = context
        .scopes
        .iter()
        .any(|held| held == scope || held == WILDCARD_SCOPE);
    if granted {
        Ok(())
    } else {
        Err(ServiceFailure::Forbidden)
    }
}

/// Sequential [`require`] over the list; the first missing scope decides
/// which error surfaces, order carries no other meaning.
pub(crate) fn require_all(context: &ScopeContext, scopes: &[&str]) -> Result<(), ServiceFailure> {
    for scope in scopes {
        require(context, scope)?;
    }
    Ok(())
}

pub(crate) fn satisfies_all(context: &ScopeContext, scopes: &[&str]) -> bool {
    require_all(context, scopes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::{require, require_all, satisfies_all, ScopeContext};
    use crate::server::errors::ServiceFailure;

    fn context(scopes: &[&str]) -> ScopeContext {
        ScopeContext {
            subject: String::from("user-1"),
            scopes: scopes.iter().map(|s| String::from(*s)).collect(),
        }
    }

    #[test]
    fn grants_held_scope_and_denies_missing() {
        let ctx = context(&["read:civic", "realtime:connect"]);
        assert!(require(&ctx, "read:civic").is_ok());
        assert_eq!(
            require(&ctx, "write:civic"),
            Err(ServiceFailure::Forbidden)
        );
    }

    #[test]
    fn wildcard_grants_any_scope() {
        let ctx = context(&["*"]);
        for scope in ["read:civic", "write:votes", "realtime:broadcast", "anything"] {
            assert!(require(&ctx, scope).is_ok(), "{scope}");
        }
    }

    #[test]
    fn require_all_stops_at_first_missing_scope() {
        let ctx = context(&["read:civic"]);
        assert!(require_all(&ctx, &["read:civic"]).is_ok());
        assert_eq!(
            require_all(&ctx, &["read:civic", "write:civic"]),
            Err(ServiceFailure::Forbidden)
        );
        assert!(satisfies_all(&ctx, &[]));
    }
}
