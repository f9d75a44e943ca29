pub(crate) mod audit;
pub(crate) mod authorize;
pub(crate) mod codec;
pub(crate) mod config;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod errors;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod queries;
pub(crate) mod ratelimit;
pub(crate) mod realtime;
pub(crate) mod registry;
pub(crate) mod router;
pub(crate) mod store;
pub(crate) mod tokens;
pub(crate) mod types;

pub use core::{AppConfig, AppState};
pub use errors::init_tracing;
pub use realtime::{spawn_background_tasks, BackgroundTasks};
pub use router::build_app;
pub use store::{InMemoryStore, RedeemOutcome, RefreshRecord, SharedStore};
