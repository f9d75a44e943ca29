#![forbid(unsafe_code)]

use std::net::SocketAddr;

use tokio::net::TcpListener;
use warden_server::{build_app, init_tracing, spawn_background_tasks, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let (app, state) = build_app(&config)?;
    // Held for the life of the process; dropping it aborts the sweeps.
    let _maintenance = spawn_background_tasks(&state);

    let addr = std::env::var("WARDEN_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid WARDEN_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "warden-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
