#![forbid(unsafe_code)]

mod server;

pub use server::{
    build_app, init_tracing, spawn_background_tasks, AppConfig, AppState, BackgroundTasks,
    InMemoryStore, RedeemOutcome, RefreshRecord, SharedStore,
};
