use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{mpsc, OnceCell, RwLock};
use warden_protocol::EventFrame;

use super::store::SharedStore;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 64 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const MIN_ACCESS_TOKEN_TTL_SECS: i64 = 60;
pub const MAX_ACCESS_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const MIN_REFRESH_TOKEN_TTL_SECS: i64 = 60 * 60;
pub const MAX_REFRESH_TOKEN_TTL_SECS: i64 = 365 * 24 * 60 * 60;
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_CONNECT_REQUESTS_PER_WINDOW: u64 = 10;
pub const DEFAULT_SEND_REQUESTS_PER_WINDOW: u64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 90;
pub const DEFAULT_STALE_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETENTION_WINDOW_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_RETENTION_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MILLIS: u64 = 250;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;
pub const TOKEN_ISSUER: &str = "warden";
pub(crate) const MIN_TOKEN_CHARS: usize = 16;
pub(crate) const MAX_TOKEN_CHARS: usize = 4096;
pub(crate) const MAX_QUERY_PARAMS: usize = 16;
pub(crate) const MAX_AUDIT_RECORDS: usize = 10_000;

// The Default secret keeps unit tests convenient; config::from_env refuses
// to start with it (or with anything shorter than MIN_SIGNING_SECRET_BYTES).
pub(crate) const DEV_SIGNING_SECRET: &str = "insecure-dev-secret-0000000000000000";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) stream_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) events_emitted: Mutex<HashMap<String, u64>>,
    pub(crate) events_dropped: Mutex<HashMap<(String, &'static str), u64>>,
    pub(crate) queries_executed: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) slow_queries: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub signing_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub clock_skew_secs: i64,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub rate_limit_window: Duration,
    pub connect_requests_per_window: u64,
    pub send_requests_per_window: u64,
    pub heartbeat_interval: Duration,
    pub stale_threshold_secs: i64,
    pub stale_sweep_interval: Duration,
    pub retention_window_secs: i64,
    pub retention_sweep_interval: Duration,
    pub slow_query_threshold: Duration,
    pub outbound_queue: usize,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::from(DEV_SIGNING_SECRET),
            access_token_ttl_secs: DEFAULT_ACCESS_TOKEN_TTL_SECS,
            refresh_token_ttl_secs: DEFAULT_REFRESH_TOKEN_TTL_SECS,
            clock_skew_secs: 0,
            allowed_origins: Vec::new(),
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            connect_requests_per_window: DEFAULT_CONNECT_REQUESTS_PER_WINDOW,
            send_requests_per_window: DEFAULT_SEND_REQUESTS_PER_WINDOW,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            stale_sweep_interval: Duration::from_secs(DEFAULT_STALE_SWEEP_INTERVAL_SECS),
            retention_window_secs: DEFAULT_RETENTION_WINDOW_SECS,
            retention_sweep_interval: Duration::from_secs(DEFAULT_RETENTION_SWEEP_INTERVAL_SECS),
            slow_query_threshold: Duration::from_millis(DEFAULT_SLOW_QUERY_THRESHOLD_MILLIS),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            database_url: None,
        }
    }
}

/// Limits frozen at startup and shared with every request task.
pub(crate) struct RuntimeConfig {
    pub(crate) access_token_ttl_secs: i64,
    pub(crate) refresh_token_ttl_secs: i64,
    pub(crate) clock_skew_secs: i64,
    pub(crate) rate_limit_window_secs: u64,
    pub(crate) connect_requests_per_window: u64,
    pub(crate) send_requests_per_window: u64,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) stale_threshold_secs: i64,
    pub(crate) stale_sweep_interval: Duration,
    pub(crate) retention_window_secs: i64,
    pub(crate) retention_sweep_interval: Duration,
    pub(crate) slow_query_threshold: Duration,
    pub(crate) outbound_queue: usize,
}

/// Fast-lookup entry for a live stream held by this process. The durable
/// row lives in `realtime_connections`; this map only carries what fan-out
/// needs: the owning subject and the outbound channel.
pub(crate) struct ConnectionHandle {
    pub(crate) user_id: String,
    pub(crate) sender: mpsc::Sender<EventFrame>,
}

/// Durable connection state, mirrored in memory when no database is
/// configured. `disconnected_at_unix == None` means live.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionRow {
    pub(crate) user_id: String,
    pub(crate) user_email: Option<String>,
    pub(crate) connected_at_unix: i64,
    pub(crate) last_heartbeat_unix: i64,
    pub(crate) disconnected_at_unix: Option<i64>,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) signing_key: Arc<Vec<u8>>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    pub(crate) connection_rows_mem: Arc<RwLock<HashMap<String, ConnectionRow>>>,
    pub(crate) room_members_mem: Arc<RwLock<HashMap<String, std::collections::HashSet<String>>>>,
    pub(crate) audit_logs: Arc<RwLock<std::collections::VecDeque<serde_json::Value>>>,
    pub(crate) started_at: Instant,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig, store: Arc<dyn SharedStore>) -> anyhow::Result<Self> {
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            store,
            signing_key: Arc::new(config.signing_secret.as_bytes().to_vec()),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_rows_mem: Arc::new(RwLock::new(HashMap::new())),
            room_members_mem: Arc::new(RwLock::new(HashMap::new())),
            audit_logs: Arc::new(RwLock::new(std::collections::VecDeque::new())),
            started_at: Instant::now(),
            runtime: Arc::new(RuntimeConfig {
                access_token_ttl_secs: config.access_token_ttl_secs,
                refresh_token_ttl_secs: config.refresh_token_ttl_secs,
                clock_skew_secs: config.clock_skew_secs,
                rate_limit_window_secs: config.rate_limit_window.as_secs(),
                connect_requests_per_window: config.connect_requests_per_window,
                send_requests_per_window: config.send_requests_per_window,
                heartbeat_interval: config.heartbeat_interval,
                stale_threshold_secs: config.stale_threshold_secs,
                stale_sweep_interval: config.stale_sweep_interval,
                retention_window_secs: config.retention_window_secs,
                retention_sweep_interval: config.retention_sweep_interval,
                slow_query_threshold: config.slow_query_threshold,
                outbound_queue: config.outbound_queue,
            }),
        })
    }
}
