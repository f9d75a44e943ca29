use std::time::Instant;

use serde_json::{json, Value};
use sqlx::{postgres::PgRow, Column, Row, TypeInfo};

use super::{
    authorize::{require_all, satisfies_all, ScopeContext},
    core::{AppState, MAX_QUERY_PARAMS},
    db::ensure_db_schema,
    errors::ServiceFailure,
    metrics::{record_query_executed, record_slow_query},
};

/// One whitelist entry. The gateway only ever runs these statements;
/// callers pick by name and supply positional parameters, never SQL.
pub(crate) struct PreparedQuery {
    pub(crate) name: &'static str,
    sql: &'static str,
    pub(crate) read_only: bool,
    pub(crate) required_scopes: &'static [&'static str],
    param_count: usize,
}

/// The full statement catalogue. `read_only` is an audit/metrics tag;
/// what actually prevents mutation is that under-scoped callers never
/// reach the driver at all.
pub(crate) static QUERY_WHITELIST: &[PreparedQuery] = &[
    PreparedQuery {
        name: "list_open_help_requests",
        sql: "SELECT id, user_id, title, body, status, created_at_unix
              FROM help_requests WHERE status = 'open'
              ORDER BY created_at_unix DESC LIMIT 100",
        read_only: true,
        required_scopes: &["help_requests:read"],
        param_count: 0,
    },
    PreparedQuery {
        name: "get_help_request",
        sql: "SELECT id, user_id, title, body, status, created_at_unix
              FROM help_requests WHERE id = $1",
        read_only: true,
        required_scopes: &["help_requests:read"],
        param_count: 1,
    },
    PreparedQuery {
        name: "list_room_messages",
        sql: "SELECT id, room_id, sender_id, body, sent_at_unix
              FROM room_messages WHERE room_id = $1
              ORDER BY sent_at_unix DESC LIMIT $2",
        read_only: true,
        required_scopes: &["rooms:read"],
        param_count: 2,
    },
    PreparedQuery {
        name: "count_live_connections",
        sql: "SELECT COUNT(*) AS live FROM realtime_connections
              WHERE disconnected_at_unix IS NULL",
        read_only: true,
        required_scopes: &["realtime:read"],
        param_count: 0,
    },
    PreparedQuery {
        name: "insert_help_request",
        sql: "INSERT INTO help_requests (user_id, title, body, status, created_at_unix)
              VALUES ($1, $2, $3, 'open', $4) RETURNING id",
        read_only: false,
        required_scopes: &["help_requests:write"],
        param_count: 4,
    },
    PreparedQuery {
        name: "update_help_request_status",
        sql: "UPDATE help_requests SET status = $2 WHERE id = $1 RETURNING id, status",
        read_only: false,
        required_scopes: &["help_requests:write"],
        param_count: 2,
    },
    PreparedQuery {
        name: "insert_vote",
        sql: "INSERT INTO votes (poll_id, user_id, choice, cast_at_unix)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (poll_id, user_id) DO UPDATE SET choice = $3, cast_at_unix = $4
              RETURNING id",
        read_only: false,
        required_scopes: &["votes:write"],
        param_count: 4,
    },
    PreparedQuery {
        name: "tally_votes",
        sql: "SELECT choice, COUNT(*) AS total FROM votes
              WHERE poll_id = $1 GROUP BY choice ORDER BY total DESC",
        read_only: true,
        required_scopes: &["votes:read"],
        param_count: 1,
    },
];

#[derive(Debug)]
pub(crate) struct QueryOutcome {
    pub(crate) rows: Vec<Value>,
    pub(crate) row_count: usize,
}

fn lookup(query_name: &str) -> Option<&'static PreparedQuery> {
    QUERY_WHITELIST.iter().find(|def| def.name == query_name)
}

/// Runs one whitelisted statement. Name lookup and scope checks happen
/// before anything touches the driver, so an unauthorized call has no
/// side effects. The slow-query log carries name and duration only;
/// parameter values may be sensitive and are never logged.
pub(crate) async fn execute_query(
    state: &AppState,
    query_name: &str,
    params: &[Value],
    context: &ScopeContext,
) -> Result<QueryOutcome, ServiceFailure> {
    let Some(def) = lookup(query_name) else {
        return Err(ServiceFailure::UnknownQuery);
    };
    require_all(context, def.required_scopes)?;
    if params.len() != def.param_count || params.len() > MAX_QUERY_PARAMS {
        return Err(ServiceFailure::InvalidRequest);
    }

    let Some(pool) = &state.db_pool else {
        tracing::error!(query = def.name, "query gateway requires a database");
        return Err(ServiceFailure::Internal);
    };
    ensure_db_schema(state).await?;

    let mut query = sqlx::query(def.sql);
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(f) = n.as_f64() {
                    query.bind(f)
                } else {
                    return Err(ServiceFailure::InvalidRequest);
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => return Err(ServiceFailure::InvalidRequest),
        };
    }

    let started = Instant::now();
    let result = query.fetch_all(pool).await;
    let elapsed = started.elapsed();
    if elapsed > state.runtime.slow_query_threshold {
        record_slow_query(def.name);
        tracing::warn!(
            query = def.name,
            elapsed_millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "slow query"
        );
    }

    match result {
        Ok(rows) => {
            record_query_executed(def.name, "ok");
            let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
            let row_count = rows.len();
            Ok(QueryOutcome { rows, row_count })
        }
        Err(e) => {
            record_query_executed(def.name, "error");
            tracing::error!(query = def.name, error = %e, "query execution failed");
            Err(ServiceFailure::Internal)
        }
    }
}

/// The whitelist subset the caller may actually run. Read-only entries
/// are visible with no context at all; everything else needs matching
/// scopes, so an anonymous caller never sees the mutating catalogue.
pub(crate) fn list_available(context: Option<&ScopeContext>) -> Vec<&'static PreparedQuery> {
    QUERY_WHITELIST
        .iter()
        .filter(|def| match context {
            Some(context) => satisfies_all(context, def.required_scopes),
            None => def.read_only,
        })
        .collect()
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .map(|v| v.map_or(Value::Null, Value::Bool)),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map(|v| v.map_or(Value::Null, |n| json!(n))),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .map(|v| v.map_or(Value::Null, |n| json!(n))),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .map(|v| v.map_or(Value::Null, |n| json!(n))),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map(|v| v.map_or(Value::Null, |n| json!(n))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .map(|v| v.map_or(Value::Null, |n| json!(n))),
            _ => row
                .try_get::<Option<String>, _>(index)
                .map(|v| v.map_or(Value::Null, Value::String)),
        };
        object.insert(column.name().to_owned(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;

    use super::{execute_query, list_available, QUERY_WHITELIST};
    use crate::server::authorize::ScopeContext;
    use crate::server::core::{AppConfig, AppState, MAX_QUERY_PARAMS};
    use crate::server::errors::ServiceFailure;
    use crate::server::store::InMemoryStore;

    fn state() -> AppState {
        AppState::new(&AppConfig::default(), Arc::new(InMemoryStore::default()))
            .expect("state builds")
    }

    fn context(scopes: &[&str]) -> ScopeContext {
        ScopeContext {
            subject: String::from("user-1"),
            scopes: scopes.iter().map(|s| String::from(*s)).collect(),
        }
    }

    #[test]
    fn whitelist_names_are_unique_and_placeholders_match_arity() {
        let mut seen = HashSet::new();
        for def in QUERY_WHITELIST {
            assert!(seen.insert(def.name), "duplicate query name {}", def.name);
            assert!(def.param_count <= MAX_QUERY_PARAMS);
            for position in 1..=def.param_count {
                let placeholder = format!("${position}");
                assert!(
                    def.sql.contains(&placeholder),
                    "{} is missing {placeholder}",
                    def.name
                );
            }
            assert!(
                !def.sql.contains(&format!("${}", def.param_count + 1)),
                "{} binds more than declared",
                def.name
            );
        }
    }

    #[tokio::test]
    async fn unknown_query_never_reaches_the_driver() {
        let state = state();
        let error = execute_query(&state, "drop_everything", &[], &context(&["*"]))
            .await
            .unwrap_err();
        assert_eq!(error, ServiceFailure::UnknownQuery);
    }

    #[tokio::test]
    async fn under_scoped_caller_is_rejected_before_execution() {
        let state = state();
        let error = execute_query(
            &state,
            "insert_help_request",
            &[json!("user-1"), json!("title"), json!("body"), json!(100)],
            &context(&["help_requests:read"]),
        )
        .await
        .unwrap_err();
        assert_eq!(error, ServiceFailure::Forbidden);
    }

    #[tokio::test]
    async fn parameter_arity_is_enforced() {
        let state = state();
        let error = execute_query(&state, "get_help_request", &[], &context(&["*"]))
            .await
            .unwrap_err();
        assert_eq!(error, ServiceFailure::InvalidRequest);
    }

    #[test]
    fn anonymous_discovery_sees_read_only_entries_only() {
        let visible = list_available(None);
        assert!(!visible.is_empty());
        assert!(visible.iter().all(|def| def.read_only));
    }

    #[test]
    fn discovery_filters_by_caller_scopes() {
        let visible = list_available(Some(&context(&["votes:read", "votes:write"])));
        let names: Vec<&str> = visible.iter().map(|def| def.name).collect();
        assert_eq!(names, vec!["insert_vote", "tally_votes"]);
    }

    #[test]
    fn wildcard_scope_sees_the_full_catalogue() {
        let visible = list_available(Some(&context(&["*"])));
        assert_eq!(visible.len(), QUERY_WHITELIST.len());
    }
}
