use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::wrappers::ReceiverStream;
use warden_core::ConnectionId;
use warden_protocol::{EventFrame, EVENT_CONNECTED, EVENT_HEARTBEAT};

use super::{
    audit::record_audit,
    authorize::{require, ScopeContext},
    core::AppState,
    errors::ServiceFailure,
    metrics::{
        record_auth_failure, record_event_dropped, record_event_emitted, record_stream_disconnect,
    },
    ratelimit::check_rate_limit,
    registry,
    tokens::{now_unix, verify_access_token},
};

pub(crate) const SCOPE_CONNECT: &str = "realtime:connect";
pub(crate) const SCOPE_SEND: &str = "realtime:send";
pub(crate) const SCOPE_BROADCAST: &str = "realtime:broadcast";

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectQuery {
    token: Option<String>,
}

/// Cleans up when the subscriber goes away for any reason: the guard is
/// owned by the response stream, so dropping the stream (client close,
/// transport error, server shutdown) tears down the heartbeat task and
/// retires the registry row exactly once.
struct StreamGuard {
    state: AppState,
    connection_id: String,
    heartbeat: JoinHandle<()>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        let state = self.state.clone();
        let connection_id = std::mem::take(&mut self.connection_id);
        tokio::spawn(async move {
            if registry::mark_disconnected(&state, &connection_id, now_unix()).await {
                record_stream_disconnect("client_closed");
            }
        });
    }
}

/// `GET /events`. EventSource cannot set headers, so the access token
/// travels in the `token` query parameter on this surface only.
pub(crate) async fn sse_events(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceFailure> {
    let Some(token) = query.token else {
        record_auth_failure("missing_token");
        return Err(ServiceFailure::Unauthenticated);
    };
    let claims = verify_access_token(&state, &token).await.map_err(|e| {
        let failure = ServiceFailure::from(e);
        record_auth_failure(failure.reason());
        failure
    })?;
    let context = ScopeContext::from(&claims);
    require(&context, SCOPE_CONNECT)?;

    let now = now_unix();
    check_rate_limit(
        &state,
        "connect",
        &claims.sub,
        state.runtime.connect_requests_per_window,
        now,
    )
    .await?;

    let connection_id = ConnectionId::new().to_string();
    let (tx, rx) = mpsc::channel::<EventFrame>(state.runtime.outbound_queue);

    registry::insert_connection(&state, &connection_id, &claims.sub, claims.email.as_deref(), now)
        .await?;
    registry::register_sender(&state, &connection_id, &claims.sub, tx.clone()).await;

    record_audit(
        &state,
        &claims.sub,
        "stream.connect",
        "granted",
        Some(json!({ "connection_id": connection_id })),
    )
    .await;

    // The queue is empty at this point, so the hello frame cannot be
    // rejected for capacity.
    let hello = EventFrame::new(
        EVENT_CONNECTED,
        json!({ "connection_id": connection_id, "user_id": claims.sub }),
    )
    .map_err(|_| ServiceFailure::Internal)?;
    if let Err(e) = tx.try_send(hello) {
        tracing::error!(error = %e, "connected frame rejected");
        return Err(ServiceFailure::Internal);
    }
    record_event_emitted(EVENT_CONNECTED);

    let heartbeat = spawn_heartbeat(state.clone(), connection_id.clone(), tx);
    let guard = StreamGuard {
        state: state.clone(),
        connection_id,
        heartbeat,
    };

    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _held = &guard;
        Ok(Event::default()
            .event(frame.event_type.as_str())
            .data(frame.data.to_string()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Emits heartbeat frames on a fixed cadence and refreshes the registry
/// row. Ends itself as soon as the row stops being live (stale sweep,
/// explicit disconnect) or the subscriber stops draining.
fn spawn_heartbeat(
    state: AppState,
    connection_id: String,
    tx: mpsc::Sender<EventFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.runtime.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the cadence
        // starts one full interval after connect.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = now_unix();
            if !registry::touch_heartbeat(&state, &connection_id, now).await {
                break;
            }
            let Ok(frame) = EventFrame::new(EVENT_HEARTBEAT, json!({ "ts": now })) else {
                break;
            };
            if tx.send(frame).await.is_err() {
                break;
            }
            record_event_emitted(EVENT_HEARTBEAT);
        }
    })
}

/// Pushes one frame to a set of resolved senders without blocking the
/// caller. A full queue drops the frame for that connection only; a
/// closed queue retires the connection. Returns the accepted count.
async fn deliver(
    state: &AppState,
    senders: Vec<(String, mpsc::Sender<EventFrame>)>,
    frame: &EventFrame,
) -> usize {
    let mut delivered = 0;
    for (connection_id, sender) in senders {
        match sender.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                record_event_emitted(frame.event_type.as_str());
            }
            Err(TrySendError::Full(_)) => {
                record_event_dropped(frame.event_type.as_str(), "queue_full");
                tracing::warn!(connection_id, "outbound queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                record_event_dropped(frame.event_type.as_str(), "closed");
                let state = state.clone();
                tokio::spawn(async move {
                    if registry::mark_disconnected(&state, &connection_id, now_unix()).await {
                        record_stream_disconnect("send_failed");
                    }
                });
            }
        }
    }
    delivered
}

/// Fans a frame out to every live connection of the room's members.
/// Members without a live connection are skipped silently.
pub(crate) async fn fan_out_to_room(
    state: &AppState,
    room_id: &str,
    frame: &EventFrame,
) -> Result<usize, ServiceFailure> {
    let members = registry::room_member_ids(state, room_id).await?;
    if members.is_empty() {
        return Ok(0);
    }
    let senders = registry::live_senders_for_users(state, &members).await;
    Ok(deliver(state, senders, frame).await)
}

/// Pushes a frame to every live connection regardless of rooms.
pub(crate) async fn broadcast_all(state: &AppState, frame: &EventFrame) -> usize {
    let senders = registry::all_live_senders(state).await;
    deliver(state, senders, frame).await
}

pub(crate) async fn run_stale_sweep_once(state: &AppState, now_unix: i64) -> usize {
    let swept = registry::sweep_stale(state, now_unix).await;
    for _ in 0..swept {
        record_stream_disconnect("stale");
    }
    swept
}

pub(crate) async fn run_retention_purge_once(state: &AppState, now_unix: i64) -> usize {
    let purged = registry::purge_disconnected(state, now_unix).await;
    if purged > 0 {
        tracing::info!(purged, "retention purge removed disconnected rows");
    }
    purged
}

/// Periodic maintenance tasks, aborted when the handle is dropped.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

pub fn spawn_background_tasks(state: &AppState) -> BackgroundTasks {
    let sweep_state = state.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_state.runtime.stale_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            run_stale_sweep_once(&sweep_state, now_unix()).await;
            sweep_state.store.prune_expired(now_unix()).await;
        }
    });

    let purge_state = state.clone();
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_state.runtime.retention_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            run_retention_purge_once(&purge_state, now_unix()).await;
        }
    });

    BackgroundTasks {
        handles: vec![sweeper, purger],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;
    use warden_protocol::{EventFrame, EVENT_ANNOUNCEMENT, EVENT_NEW_MESSAGE};

    use super::{broadcast_all, fan_out_to_room, run_stale_sweep_once};
    use crate::server::core::{AppConfig, AppState};
    use crate::server::registry::{insert_connection, join_room, register_sender};
    use crate::server::store::InMemoryStore;

    fn state() -> AppState {
        AppState::new(&AppConfig::default(), Arc::new(InMemoryStore::default()))
            .expect("state builds")
    }

    fn frame(event_type: &str) -> EventFrame {
        EventFrame::new(event_type, json!({ "body": "hi" })).unwrap()
    }

    #[tokio::test]
    async fn room_fan_out_reaches_live_members_only() {
        let state = state();
        for user in ["user-1", "user-2", "user-3"] {
            join_room(&state, "room-a", user, 10).await.unwrap();
        }
        // user-3 is a member but holds no live connection.
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        register_sender(&state, "conn-1", "user-1", tx1).await;
        register_sender(&state, "conn-2", "user-2", tx2).await;

        let delivered = fan_out_to_room(&state, "room-a", &frame(EVENT_NEW_MESSAGE))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn fan_out_to_empty_room_delivers_nothing() {
        let state = state();
        let delivered = fan_out_to_room(&state, "room-missing", &frame(EVENT_NEW_MESSAGE))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_frame_without_blocking_other_recipients() {
        let state = state();
        join_room(&state, "room-a", "user-1", 10).await.unwrap();
        join_room(&state, "room-a", "user-2", 10).await.unwrap();

        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(4);
        tx1.try_send(frame(EVENT_NEW_MESSAGE)).unwrap();
        register_sender(&state, "conn-1", "user-1", tx1).await;
        register_sender(&state, "conn-2", "user-2", tx2.clone()).await;
        drop(tx2);

        let delivered = fan_out_to_room(&state, "room-a", &frame(EVENT_NEW_MESSAGE))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_ignores_room_membership() {
        let state = state();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        register_sender(&state, "conn-1", "user-1", tx1).await;
        register_sender(&state, "conn-2", "user-2", tx2).await;

        let delivered = broadcast_all(&state, &frame(EVENT_ANNOUNCEMENT)).await;
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_sweep_pass_reports_swept_count() {
        let state = state();
        insert_connection(&state, "conn-1", "user-1", None, 1_000).await.unwrap();
        assert_eq!(run_stale_sweep_once(&state, 5_000).await, 1);
        assert_eq!(run_stale_sweep_once(&state, 5_000).await, 0);
    }
}
