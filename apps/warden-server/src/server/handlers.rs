use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use warden_core::RoomId;
use warden_protocol::{
    validate_message, EventFrame, EVENT_ANNOUNCEMENT, EVENT_NEW_MESSAGE,
};

use super::{
    audit::record_audit,
    authorize::{require, ScopeContext},
    core::AppState,
    errors::ServiceFailure,
    metrics::{record_auth_failure, render_metrics},
    queries::{execute_query, list_available},
    ratelimit::check_rate_limit,
    realtime::{broadcast_all, fan_out_to_room, SCOPE_BROADCAST, SCOPE_SEND},
    registry,
    tokens::{
        issue_access_token, issue_refresh_token, now_unix, refresh_access_token, revoke_token,
        verify_access_token,
    },
    types::{
        AccessTokenResponse, AuditResponse, BroadcastRequest, BroadcastResponse, HealthResponse,
        IssueAccessRequest, IssueRefreshRequest, QueryCatalogResponse, QueryInfo, QueryRequest,
        QueryResponse, RefreshTokenResponse, RevokeResponse, RoomJoinRequest,
        RoomMembershipResponse, SendMessageRequest, SendMessageResponse, TokenRequest,
        VerifyResponse,
    },
};

pub(crate) const SCOPE_ROOMS_WRITE: &str = "rooms:write";
pub(crate) const SCOPE_AUDIT_READ: &str = "audit:read";

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves the bearer token on a request to a verified scope context.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ScopeContext, ServiceFailure> {
    let Some(token) = bearer_token(headers) else {
        record_auth_failure("missing_token");
        return Err(ServiceFailure::Unauthenticated);
    };
    let claims = verify_access_token(state, token).await.map_err(|e| {
        let failure = ServiceFailure::from(e);
        record_auth_failure(failure.reason());
        failure
    })?;
    Ok(ScopeContext::from(&claims))
}

// Token minting trusts its caller: this surface is reached only from the
// backend application over the private network, never from end users.

pub(crate) async fn generate_access_token(
    State(state): State<AppState>,
    Json(request): Json<IssueAccessRequest>,
) -> Result<Json<AccessTokenResponse>, ServiceFailure> {
    let issued =
        issue_access_token(&state, &request.user_id, &request.scopes, request.email).await?;
    Ok(Json(AccessTokenResponse {
        access_token: issued.token,
        expires_in: issued.expires_in_secs,
        token_type: "Bearer",
    }))
}

pub(crate) async fn generate_refresh_token(
    State(state): State<AppState>,
    Json(request): Json<IssueRefreshRequest>,
) -> Result<Json<RefreshTokenResponse>, ServiceFailure> {
    let issued =
        issue_refresh_token(&state, &request.user_id, &request.scopes, request.email).await?;
    Ok(Json(RefreshTokenResponse {
        refresh_token: issued.token,
        expires_in: issued.expires_in_secs,
    }))
}

pub(crate) async fn verify_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<VerifyResponse>, ServiceFailure> {
    let claims = verify_access_token(&state, &request.token).await.map_err(|e| {
        let failure = ServiceFailure::from(e);
        record_auth_failure(failure.reason());
        failure
    })?;
    Ok(Json(VerifyResponse {
        sub: claims.sub,
        scopes: claims.scopes,
        iat: claims.iat,
        exp: claims.exp,
        email: claims.email,
    }))
}

pub(crate) async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<AccessTokenResponse>, ServiceFailure> {
    let issued = refresh_access_token(&state, &request.token).await.map_err(|failure| {
        if failure != ServiceFailure::Internal {
            record_auth_failure(failure.reason());
        }
        failure
    })?;
    Ok(Json(AccessTokenResponse {
        access_token: issued.token,
        expires_in: issued.expires_in_secs,
        token_type: "Bearer",
    }))
}

pub(crate) async fn revoke(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<RevokeResponse>, ServiceFailure> {
    revoke_token(&state, &request.token).await?;
    Ok(Json(RevokeResponse { success: true }))
}

async fn dispatch_query(
    state: &AppState,
    headers: &HeaderMap,
    request: &QueryRequest,
    surface: &'static str,
) -> Result<Json<QueryResponse>, ServiceFailure> {
    let context = authenticate(state, headers).await?;
    let result = execute_query(state, &request.query_name, &request.params, &context).await;
    let outcome = if result.is_ok() { "granted" } else { "denied" };
    record_audit(
        state,
        &context.subject,
        surface,
        outcome,
        Some(json!({ "query": request.query_name })),
    )
    .await;
    let outcome = result?;
    Ok(Json(QueryResponse {
        rows: outcome.rows,
        row_count: outcome.row_count,
    }))
}

pub(crate) async fn read_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ServiceFailure> {
    dispatch_query(&state, &headers, &request, "query.read").await
}

pub(crate) async fn write_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ServiceFailure> {
    dispatch_query(&state, &headers, &request, "query.write").await
}

/// Capability discovery. Anonymous callers see the read-only subset; a
/// presented token must still verify even though it only widens the view.
pub(crate) async fn list_queries(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueryCatalogResponse>, ServiceFailure> {
    let context = if bearer_token(&headers).is_some() {
        Some(authenticate(&state, &headers).await?)
    } else {
        None
    };
    let available_queries = list_available(context.as_ref())
        .into_iter()
        .map(|def| QueryInfo {
            name: def.name,
            read_only: def.read_only,
            required_scopes: def.required_scopes.to_vec(),
        })
        .collect();
    Ok(Json(QueryCatalogResponse { available_queries }))
}

pub(crate) async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ServiceFailure> {
    let context = authenticate(&state, &headers).await?;
    require(&context, SCOPE_SEND)?;

    let room_id =
        RoomId::try_from(request.room_id).map_err(|_| ServiceFailure::InvalidRequest)?;
    validate_message(&request.message).map_err(|e| match e {
        warden_protocol::ProtocolError::OversizedMessage { .. } => ServiceFailure::PayloadTooLarge,
        _ => ServiceFailure::InvalidRequest,
    })?;

    let now = now_unix();
    check_rate_limit(
        &state,
        "send",
        &context.subject,
        state.runtime.send_requests_per_window,
        now,
    )
    .await?;

    let frame = EventFrame::new(
        EVENT_NEW_MESSAGE,
        json!({
            "room_id": room_id.as_str(),
            "sender_id": context.subject,
            "message": request.message,
            "sent_at": now,
        }),
    )
    .map_err(|_| ServiceFailure::Internal)?;
    let recipients = fan_out_to_room(&state, room_id.as_str(), &frame).await?;

    record_audit(
        &state,
        &context.subject,
        "message.send",
        "granted",
        Some(json!({ "room_id": room_id.as_str(), "recipients": recipients })),
    )
    .await;

    Ok(Json(SendMessageResponse {
        success: true,
        recipients,
    }))
}

pub(crate) async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ServiceFailure> {
    let context = authenticate(&state, &headers).await?;
    require(&context, SCOPE_BROADCAST)?;
    validate_message(&request.message).map_err(|e| match e {
        warden_protocol::ProtocolError::OversizedMessage { .. } => ServiceFailure::PayloadTooLarge,
        _ => ServiceFailure::InvalidRequest,
    })?;

    let frame = EventFrame::new(
        EVENT_ANNOUNCEMENT,
        json!({ "message": request.message, "sent_at": now_unix() }),
    )
    .map_err(|_| ServiceFailure::Internal)?;
    let recipients = broadcast_all(&state, &frame).await;

    record_audit(
        &state,
        &context.subject,
        "message.broadcast",
        "granted",
        Some(json!({ "recipients": recipients })),
    )
    .await;

    Ok(Json(BroadcastResponse {
        success: true,
        recipients,
    }))
}

pub(crate) async fn join_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RoomJoinRequest>,
) -> Result<Json<RoomMembershipResponse>, ServiceFailure> {
    let context = authenticate(&state, &headers).await?;
    require(&context, SCOPE_ROOMS_WRITE)?;

    let room_id =
        RoomId::try_from(request.room_id).map_err(|_| ServiceFailure::InvalidRequest)?;
    let user_id = warden_core::SubjectId::try_from(request.user_id)
        .map_err(|_| ServiceFailure::InvalidRequest)?;

    registry::join_room(&state, room_id.as_str(), user_id.as_str(), now_unix()).await?;
    record_audit(
        &state,
        &context.subject,
        "room.join",
        "granted",
        Some(json!({ "room_id": room_id.as_str(), "user_id": user_id.as_str() })),
    )
    .await;
    Ok(Json(RoomMembershipResponse { success: true }))
}

pub(crate) async fn leave_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((room_id, user_id)): Path<(String, String)>,
) -> Result<Json<RoomMembershipResponse>, ServiceFailure> {
    let context = authenticate(&state, &headers).await?;
    require(&context, SCOPE_ROOMS_WRITE)?;

    let room_id = RoomId::try_from(room_id).map_err(|_| ServiceFailure::InvalidRequest)?;
    let user_id =
        warden_core::SubjectId::try_from(user_id).map_err(|_| ServiceFailure::InvalidRequest)?;

    registry::leave_room(&state, room_id.as_str(), user_id.as_str()).await?;
    record_audit(
        &state,
        &context.subject,
        "room.leave",
        "granted",
        Some(json!({ "room_id": room_id.as_str(), "user_id": user_id.as_str() })),
    )
    .await;
    Ok(Json(RoomMembershipResponse { success: true }))
}

pub(crate) async fn get_audit_log(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuditResponse>, ServiceFailure> {
    let context = authenticate(&state, &headers).await?;
    require(&context, SCOPE_AUDIT_READ)?;
    let records = state.audit_logs.read().await.iter().cloned().collect();
    Ok(Json(AuditResponse { records }))
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = if state.store.healthy().await {
        "ok"
    } else {
        "unreachable"
    };
    let database = match &state.db_pool {
        Some(pool) => {
            if sqlx::query("SELECT 1").execute(pool).await.is_ok() {
                "ok"
            } else {
                "unreachable"
            }
        }
        None => "not_configured",
    };
    let status = if store == "ok" && database != "unreachable" {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        store,
        database,
        live_connections: registry::live_connection_count(&state).await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub(crate) async fn metrics() -> impl IntoResponse {
    (
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(),
    )
}
