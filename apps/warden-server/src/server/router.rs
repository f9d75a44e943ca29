use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        broadcast, generate_access_token, generate_refresh_token, get_audit_log, health,
        join_room, leave_room, list_queries, metrics, read_query, refresh_token, revoke,
        send_message, verify_token, write_query,
    },
    realtime::sse_events,
    store::InMemoryStore,
};

/// Builds the service router plus its shared state. The state handle is
/// returned so the caller can spawn the maintenance tasks against it.
///
/// # Errors
/// Fails on configuration the service cannot run with.
pub fn build_app(config: &AppConfig) -> anyhow::Result<(Router, AppState)> {
    let state = AppState::new(config, Arc::new(InMemoryStore::default()))?;
    let router = build_router_with_state(config, state.clone())?;
    Ok((router, state))
}

pub(crate) fn build_router_with_state(
    config: &AppConfig,
    state: AppState,
) -> anyhow::Result<Router> {
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!(
            "global rate limit must be at least 1 request per minute"
        ));
    }
    if config.connect_requests_per_window == 0 || config.send_requests_per_window == 0 {
        return Err(anyhow!("realtime rate limits must be at least 1 request"));
    }
    if config.outbound_queue == 0 {
        return Err(anyhow!("outbound queue must hold at least 1 frame"));
    }
    if config.stale_threshold_secs
        < i64::try_from(config.heartbeat_interval.as_secs().saturating_mul(2)).unwrap_or(i64::MAX)
    {
        return Err(anyhow!(
            "stale threshold must be at least twice the heartbeat interval"
        ));
    }
    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return Err(anyhow!("allowed origins must be explicit, never `*`"));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let request_id_header = HeaderName::from_static("x-request-id");

    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([http::header::AUTHORIZATION, http::header::CONTENT_TYPE]);
    if !config.allowed_origins.is_empty() {
        let origins = config
            .allowed_origins
            .iter()
            .map(|origin| {
                origin
                    .parse::<HeaderValue>()
                    .map_err(|_| anyhow!("invalid allowed origin {origin:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tokens/access", post(generate_access_token))
        .route("/tokens/refresh-token", post(generate_refresh_token))
        .route("/tokens/verify", post(verify_token))
        .route("/tokens/refresh", post(refresh_token))
        .route("/tokens/revoke", post(revoke))
        .route("/queries", get(list_queries))
        .route("/queries/read", post(read_query))
        .route("/queries/write", post(write_query))
        .route("/events", get(sse_events))
        .route("/send-message", post(send_message))
        .route("/broadcast", post(broadcast))
        .route("/rooms/join", post(join_room))
        .route("/rooms/{room_id}/members/{user_id}", delete(leave_room))
        .route("/audit", get(get_audit_log));

    Ok(routes
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(GovernorLayer::new(governor_config))
                .layer(cors),
        ))
}
