mod api;
mod cache;
mod config;
mod constants;
mod convert;
mod engine;
mod error;
mod http_client;
mod resolver;
mod types;
mod utils;
mod walker;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue};
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use tokio::fs;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{current_file, dated_file, download, healthz};
use crate::cache::clean_weather_dir;
use crate::config::Config;
use crate::constants::{STATIC_CACHE_CONTROL, USER_AGENT};
use crate::convert::Grib2Json;
use crate::engine::Engine;
use crate::http_client::HttpFetcher;
use crate::types::AppState;
use crate::utils::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Arc::new(Config::from_env()?);
    fs::create_dir_all(cfg.weather_dir())
        .await
        .with_context(|| format!("Failed to create {}", cfg.weather_dir().display()))?;

    let http = Client::builder()
        .timeout(cfg.request_timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build reqwest client")?;

    let engine = Engine::new(
        cfg.clone(),
        Arc::new(HttpFetcher::new(http)),
        Arc::new(Grib2Json::new(cfg.converter_path.clone())),
    );
    let state = AppState {
        engine: Arc::new(engine),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/download", get(download))
        .route("/data/weather/current/{file}", get(current_file))
        .route("/data/weather/{year}/{month}/{day}/{file}", get(dated_file))
        .fallback_service(ServeDir::new(&cfg.static_dir))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static(STATIC_CACHE_CONTROL),
        ))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;

    info!(
        "Serving {} and GFS data from {} on http://{}",
        cfg.static_dir.display(),
        cfg.archive_url,
        cfg.listen_addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if cfg.clean_on_exit {
        clean_weather_dir(&cfg.weather_dir()).await;
    }
    info!("Stopped");
    Ok(())
}
