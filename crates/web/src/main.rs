mod api;
mod metrics;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("web", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = common::db::AsyncDb::open(&config.database.path).await?;

    let handle = metrics::init_global()?;

    let web_port = config.web.as_ref().map_or(8080, |w| w.port);
    let web_host = config
        .web
        .as_ref()
        .map_or("0.0.0.0".to_string(), |w| w.host.clone());

    let state = Arc::new(api::AppState::new(&db, &config, Some(handle)));
    if state.api_key.is_none() {
        tracing::warn!("no web.api_key configured; verification writes are unauthenticated");
    }

    let app = api::router(state);
    let addr: SocketAddr = format!("{web_host}:{web_port}").parse()?;
    tracing::info!(%addr, "trusttrade api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
