use std::collections::HashSet;

use sqlx::Row;
use tokio::sync::mpsc;
use warden_protocol::EventFrame;

use super::{
    core::{AppState, ConnectionHandle, ConnectionRow},
    db::ensure_db_schema,
    errors::ServiceFailure,
};

fn internal(context: &'static str) -> impl FnOnce(sqlx::Error) -> ServiceFailure {
    move |e| {
        tracing::error!(error = %e, context, "registry query failed");
        ServiceFailure::Internal
    }
}

/// Inserts a `Live` row for a freshly authorized stream. The in-process
/// sender is registered separately via [`register_sender`].
pub(crate) async fn insert_connection(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
    user_email: Option<&str>,
    now_unix: i64,
) -> Result<(), ServiceFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        sqlx::query(
            "INSERT INTO realtime_connections
                 (connection_id, user_id, user_email, connected_at_unix, last_heartbeat_unix)
             VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(connection_id)
        .bind(user_id)
        .bind(user_email)
        .bind(now_unix)
        .execute(pool)
        .await
        .map_err(internal("insert_connection"))?;
        return Ok(());
    }

    state.connection_rows_mem.write().await.insert(
        connection_id.to_owned(),
        ConnectionRow {
            user_id: user_id.to_owned(),
            user_email: user_email.map(ToOwned::to_owned),
            connected_at_unix: now_unix,
            last_heartbeat_unix: now_unix,
            disconnected_at_unix: None,
        },
    );
    Ok(())
}

pub(crate) async fn register_sender(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
    sender: mpsc::Sender<EventFrame>,
) {
    state.connection_senders.write().await.insert(
        connection_id.to_owned(),
        ConnectionHandle {
            user_id: user_id.to_owned(),
            sender,
        },
    );
}

/// Refreshes `last_heartbeat`. Returns `false` when the row is missing or
/// already disconnected, signalling the heartbeat task to stop without
/// another write.
pub(crate) async fn touch_heartbeat(state: &AppState, connection_id: &str, now_unix: i64) -> bool {
    if let Some(pool) = &state.db_pool {
        let updated = sqlx::query(
            "UPDATE realtime_connections
             SET last_heartbeat_unix = $2
             WHERE connection_id = $1 AND disconnected_at_unix IS NULL",
        )
        .bind(connection_id)
        .bind(now_unix)
        .execute(pool)
        .await;
        return match updated {
            Ok(result) => result.rows_affected() == 1,
            Err(e) => {
                tracing::error!(error = %e, "heartbeat update failed");
                false
            }
        };
    }

    let mut rows = state.connection_rows_mem.write().await;
    match rows.get_mut(connection_id) {
        Some(row) if row.disconnected_at_unix.is_none() => {
            row.last_heartbeat_unix = now_unix;
            true
        }
        _ => false,
    }
}

fn log_session_close(
    connection_id: &str,
    user_id: &str,
    user_email: Option<&str>,
    session_secs: i64,
) {
    tracing::info!(
        connection_id,
        user_id,
        user_email = user_email.unwrap_or(""),
        session_secs,
        "connection closed"
    );
}

/// Marks a connection disconnected and drops its sender. Idempotent:
/// repeating it for an already-disconnected id is a no-op returning
/// `false`.
pub(crate) async fn mark_disconnected(
    state: &AppState,
    connection_id: &str,
    now_unix: i64,
) -> bool {
    state.connection_senders.write().await.remove(connection_id);

    if let Some(pool) = &state.db_pool {
        let closed = sqlx::query(
            "UPDATE realtime_connections
             SET disconnected_at_unix = $2
             WHERE connection_id = $1 AND disconnected_at_unix IS NULL
             RETURNING user_id, user_email, connected_at_unix",
        )
        .bind(connection_id)
        .bind(now_unix)
        .fetch_optional(pool)
        .await;
        return match closed {
            Ok(Some(row)) => {
                let user_id: String = row.try_get("user_id").unwrap_or_default();
                let user_email: Option<String> = row.try_get("user_email").unwrap_or_default();
                let connected_at: i64 = row.try_get("connected_at_unix").unwrap_or(now_unix);
                log_session_close(
                    connection_id,
                    &user_id,
                    user_email.as_deref(),
                    now_unix - connected_at,
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(error = %e, "disconnect update failed");
                false
            }
        };
    }

    let mut rows = state.connection_rows_mem.write().await;
    match rows.get_mut(connection_id) {
        Some(row) if row.disconnected_at_unix.is_none() => {
            row.disconnected_at_unix = Some(now_unix);
            log_session_close(
                connection_id,
                &row.user_id,
                row.user_email.as_deref(),
                now_unix - row.connected_at_unix,
            );
            true
        }
        _ => false,
    }
}

/// Disconnects every live row whose heartbeat lapsed past the stale
/// threshold. Recovers half-open transports that never sent a close.
pub(crate) async fn sweep_stale(state: &AppState, now_unix: i64) -> usize {
    let cutoff = now_unix - state.runtime.stale_threshold_secs;

    let stale_ids: Vec<String> = if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT connection_id FROM realtime_connections
             WHERE disconnected_at_unix IS NULL AND last_heartbeat_unix < $1",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await;
        match rows {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.try_get("connection_id").ok())
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "stale sweep select failed");
                return 0;
            }
        }
    } else {
        state
            .connection_rows_mem
            .read()
            .await
            .iter()
            .filter(|(_, row)| {
                row.disconnected_at_unix.is_none() && row.last_heartbeat_unix < cutoff
            })
            .map(|(id, _)| id.clone())
            .collect()
    };

    let mut swept = 0;
    for connection_id in stale_ids {
        if mark_disconnected(state, &connection_id, now_unix).await {
            swept += 1;
        }
    }
    if swept > 0 {
        tracing::info!(swept, "stale sweep disconnected lapsed connections");
    }
    swept
}

/// Deletes rows disconnected longer ago than the retention window,
/// bounding storage growth.
pub(crate) async fn purge_disconnected(state: &AppState, now_unix: i64) -> usize {
    let cutoff = now_unix - state.runtime.retention_window_secs;

    if let Some(pool) = &state.db_pool {
        let deleted = sqlx::query(
            "DELETE FROM realtime_connections
             WHERE disconnected_at_unix IS NOT NULL AND disconnected_at_unix < $1",
        )
        .bind(cutoff)
        .execute(pool)
        .await;
        return match deleted {
            Ok(result) => usize::try_from(result.rows_affected()).unwrap_or(usize::MAX),
            Err(e) => {
                tracing::error!(error = %e, "retention purge failed");
                0
            }
        };
    }

    let mut rows = state.connection_rows_mem.write().await;
    let before = rows.len();
    rows.retain(|_, row| {
        row.disconnected_at_unix
            .is_none_or(|disconnected| disconnected >= cutoff)
    });
    before - rows.len()
}

pub(crate) async fn live_connection_count(state: &AppState) -> usize {
    if let Some(pool) = &state.db_pool {
        let count = sqlx::query(
            "SELECT COUNT(*) AS live FROM realtime_connections
             WHERE disconnected_at_unix IS NULL",
        )
        .fetch_one(pool)
        .await
        .and_then(|row| row.try_get::<i64, _>("live"));
        return match count {
            Ok(value) => usize::try_from(value).unwrap_or(0),
            Err(e) => {
                tracing::error!(error = %e, "live count failed");
                0
            }
        };
    }

    state
        .connection_rows_mem
        .read()
        .await
        .values()
        .filter(|row| row.disconnected_at_unix.is_none())
        .count()
}

pub(crate) async fn join_room(
    state: &AppState,
    room_id: &str,
    user_id: &str,
    now_unix: i64,
) -> Result<(), ServiceFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        sqlx::query(
            "INSERT INTO room_members (room_id, user_id, joined_at_unix)
             VALUES ($1, $2, $3)
             ON CONFLICT (room_id, user_id) DO NOTHING",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(now_unix)
        .execute(pool)
        .await
        .map_err(internal("join_room"))?;
        return Ok(());
    }

    state
        .room_members_mem
        .write()
        .await
        .entry(room_id.to_owned())
        .or_default()
        .insert(user_id.to_owned());
    Ok(())
}

pub(crate) async fn leave_room(
    state: &AppState,
    room_id: &str,
    user_id: &str,
) -> Result<(), ServiceFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(internal("leave_room"))?;
        return Ok(());
    }

    let mut rooms = state.room_members_mem.write().await;
    if let Some(members) = rooms.get_mut(room_id) {
        members.remove(user_id);
        if members.is_empty() {
            rooms.remove(room_id);
        }
    }
    Ok(())
}

pub(crate) async fn room_member_ids(
    state: &AppState,
    room_id: &str,
) -> Result<HashSet<String>, ServiceFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let rows = sqlx::query("SELECT user_id FROM room_members WHERE room_id = $1")
            .bind(room_id)
            .fetch_all(pool)
            .await
            .map_err(internal("room_member_ids"))?;
        return Ok(rows
            .iter()
            .filter_map(|row| row.try_get("user_id").ok())
            .collect());
    }

    Ok(state
        .room_members_mem
        .read()
        .await
        .get(room_id)
        .cloned()
        .unwrap_or_default())
}

/// Resolves a user set to the senders of its live connections held by
/// this process. Membership is logical; a member with no live connection
/// simply resolves to nothing.
pub(crate) async fn live_senders_for_users(
    state: &AppState,
    user_ids: &HashSet<String>,
) -> Vec<(String, mpsc::Sender<EventFrame>)> {
    state
        .connection_senders
        .read()
        .await
        .iter()
        .filter(|(_, handle)| user_ids.contains(&handle.user_id))
        .map(|(id, handle)| (id.clone(), handle.sender.clone()))
        .collect()
}

pub(crate) async fn all_live_senders(state: &AppState) -> Vec<(String, mpsc::Sender<EventFrame>)> {
    state
        .connection_senders
        .read()
        .await
        .iter()
        .map(|(id, handle)| (id.clone(), handle.sender.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{
        insert_connection, join_room, leave_room, live_connection_count, live_senders_for_users,
        mark_disconnected, purge_disconnected, register_sender, room_member_ids, sweep_stale,
        touch_heartbeat,
    };
    use crate::server::core::{AppConfig, AppState};
    use crate::server::store::InMemoryStore;

    fn state() -> AppState {
        AppState::new(&AppConfig::default(), Arc::new(InMemoryStore::default()))
            .expect("state builds")
    }

    #[tokio::test]
    async fn connection_lifecycle_live_disconnect_purge() {
        let state = state();
        insert_connection(&state, "conn-1", "user-1", Some("u1@example.org"), 1_000)
            .await
            .unwrap();
        assert_eq!(live_connection_count(&state).await, 1);

        assert!(touch_heartbeat(&state, "conn-1", 1_030).await);
        assert!(mark_disconnected(&state, "conn-1", 1_060).await);
        assert_eq!(live_connection_count(&state).await, 0);
        {
            // The closed row keeps its identity fields until the purge.
            let rows = state.connection_rows_mem.read().await;
            assert_eq!(rows["conn-1"].user_email.as_deref(), Some("u1@example.org"));
            assert_eq!(rows["conn-1"].connected_at_unix, 1_000);
        }
        // Marking twice is a no-op, not an error.
        assert!(!mark_disconnected(&state, "conn-1", 1_061).await);
        assert!(!touch_heartbeat(&state, "conn-1", 1_062).await);

        // Default retention is 24h; the row survives until then.
        assert_eq!(purge_disconnected(&state, 1_060 + 60).await, 0);
        let purged = purge_disconnected(&state, 1_061 + 24 * 60 * 60).await;
        assert_eq!(purged, 1);
        assert!(state.connection_rows_mem.read().await.is_empty());
    }

    #[tokio::test]
    async fn stale_sweep_disconnects_lapsed_heartbeats_only() {
        let state = state();
        insert_connection(&state, "conn-fresh", "user-1", None, 1_000).await.unwrap();
        insert_connection(&state, "conn-stale", "user-2", None, 1_000).await.unwrap();
        touch_heartbeat(&state, "conn-fresh", 1_200).await;

        // Default stale threshold is 90s past the last heartbeat.
        let swept = sweep_stale(&state, 1_200).await;
        assert_eq!(swept, 1);
        let rows = state.connection_rows_mem.read().await;
        assert!(rows["conn-fresh"].disconnected_at_unix.is_none());
        assert_eq!(rows["conn-stale"].disconnected_at_unix, Some(1_200));
    }

    #[tokio::test]
    async fn stale_sweep_drops_the_cached_sender() {
        let state = state();
        insert_connection(&state, "conn-1", "user-1", None, 1_000).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        register_sender(&state, "conn-1", "user-1", tx).await;

        sweep_stale(&state, 2_000).await;
        assert!(state.connection_senders.read().await.is_empty());
    }

    #[tokio::test]
    async fn room_membership_is_unique_and_reversible() {
        let state = state();
        join_room(&state, "room-a", "user-1", 10).await.unwrap();
        join_room(&state, "room-a", "user-1", 11).await.unwrap();
        join_room(&state, "room-a", "user-2", 12).await.unwrap();

        let members = room_member_ids(&state, "room-a").await.unwrap();
        assert_eq!(members.len(), 2);

        leave_room(&state, "room-a", "user-1").await.unwrap();
        let members = room_member_ids(&state, "room-a").await.unwrap();
        assert_eq!(members, HashSet::from([String::from("user-2")]));
    }

    #[tokio::test]
    async fn fan_out_resolution_finds_only_live_members() {
        let state = state();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        register_sender(&state, "conn-1", "user-1", tx1).await;
        register_sender(&state, "conn-2", "user-2", tx2).await;

        let targets = HashSet::from([String::from("user-1"), String::from("user-3")]);
        let senders = live_senders_for_users(&state, &targets).await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].0, "conn-1");
    }
}
