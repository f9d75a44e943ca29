use super::{core::AppState, errors::ServiceFailure};

const CREATE_REALTIME_CONNECTIONS_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS realtime_connections (
                    connection_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    user_email TEXT NULL,
                    connected_at_unix BIGINT NOT NULL,
                    last_heartbeat_unix BIGINT NOT NULL,
                    disconnected_at_unix BIGINT NULL
                )";
const CREATE_REALTIME_CONNECTIONS_LIVE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_realtime_connections_live
                    ON realtime_connections(last_heartbeat_unix)
                    WHERE disconnected_at_unix IS NULL";
const CREATE_REALTIME_CONNECTIONS_DISCONNECTED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_realtime_connections_disconnected
                    ON realtime_connections(disconnected_at_unix)
                    WHERE disconnected_at_unix IS NOT NULL";
const CREATE_ROOM_MEMBERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS room_members (
                    room_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    joined_at_unix BIGINT NOT NULL,
                    PRIMARY KEY (room_id, user_id)
                )";
const CREATE_ROOM_MEMBERS_USER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_room_members_user
                    ON room_members(user_id)";

/// Bootstraps the two tables this core owns. Runs once per process under
/// an advisory lock so concurrent instances do not race the DDL.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ServiceFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5741_5244_454e_3031;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            sqlx::query(CREATE_REALTIME_CONNECTIONS_TABLE_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_REALTIME_CONNECTIONS_LIVE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_REALTIME_CONNECTIONS_DISCONNECTED_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_ROOM_MEMBERS_TABLE_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_ROOM_MEMBERS_USER_INDEX_SQL)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "schema bootstrap failed");
            ServiceFailure::Internal
        })?;
    Ok(())
}
