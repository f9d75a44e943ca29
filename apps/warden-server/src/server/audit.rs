use serde_json::json;

use super::core::{AppState, MAX_AUDIT_RECORDS};
use super::tokens::now_unix;

/// Appends one authorization decision to the in-process audit trail and
/// mirrors it as a structured tracing event. Callers must never pass raw
/// token material as `actor` or `detail`; use
/// [`super::tokens::token_fingerprint`] for token references.
pub(crate) async fn record_audit(
    state: &AppState,
    actor: &str,
    action: &'static str,
    outcome: &'static str,
    detail: Option<serde_json::Value>,
) {
    tracing::info!(actor, action, outcome, "audit");

    let mut entry = json!({
        "at": now_unix(),
        "actor": actor,
        "action": action,
        "outcome": outcome,
    });
    if let (Some(object), Some(detail)) = (entry.as_object_mut(), detail) {
        object.insert(String::from("detail"), detail);
    }

    let mut logs = state.audit_logs.write().await;
    if logs.len() >= MAX_AUDIT_RECORDS {
        logs.pop_front();
    }
    logs.push_back(entry);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::record_audit;
    use crate::server::core::{AppConfig, AppState};
    use crate::server::store::InMemoryStore;

    #[tokio::test]
    async fn records_actor_action_outcome_and_detail() {
        let state = AppState::new(&AppConfig::default(), Arc::new(InMemoryStore::default()))
            .expect("state builds");

        record_audit(
            &state,
            "user-1",
            "token.issue",
            "granted",
            Some(json!({"token": "a1b2c3d4e5f6"})),
        )
        .await;

        let logs = state.audit_logs.read().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["actor"], "user-1");
        assert_eq!(logs[0]["action"], "token.issue");
        assert_eq!(logs[0]["outcome"], "granted");
        assert_eq!(logs[0]["detail"]["token"], "a1b2c3d4e5f6");
    }
}
