//! Entry point: load configuration, bring up the tracking store and
//! precache manager, then serve (§2, §6).
//!
//! Subsystems are constructed sequentially and logged as they come up,
//! then served via `TcpListener::bind` + `axum::serve`; logging setup uses
//! `tracing-subscriber`, the crate's ambient choice throughout
//! `precache`/`tracking`.

use std::net::SocketAddr;
use std::sync::Arc;

use irobot::{auth, config, config::Config, http, precache, remote, tracking};

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

fn build_auth_handlers(config: &Config) -> Vec<Arc<dyn auth::Authenticator>> {
    config
        .httpd
        .authentication
        .iter()
        .filter_map(|name| match name.as_str() {
            "basic_auth" => {
                Some(Arc::new(auth::basic::BasicAuthHandler::new(config.basic_auth.clone()))
                    as Arc<dyn auth::Authenticator>)
            }
            "arvados_auth" => {
                Some(Arc::new(auth::arvados::ArvadosAuthHandler::new(config.arvados_auth.clone()))
                    as Arc<dyn auth::Authenticator>)
            }
            other => {
                tracing::warn!(handler = %other, "unrecognised authentication handler, skipping");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config.logging);

    tracing::info!("starting irobot gateway");

    let store = tracking::TrackingStore::open(&config.precache.index, true).await?;
    let remote = Arc::new(remote::IrodsHttpClient::new(
        config.irods.base_url.clone(),
        config.irods.max_connections,
    ));
    let precache = precache::PrecacheManager::new(store.clone(), remote, config.precache.clone()).await?;

    let auth_handlers = build_auth_handlers(&config);
    if auth_handlers.is_empty() {
        tracing::warn!("no authentication handlers configured; every request will be unauthorized");
    }

    let config = Arc::new(config);
    let state = http::AppState::new(precache, store, config.clone(), auth_handlers);
    let router = http::build_router(state);

    let addr = SocketAddr::from((config.httpd.bind_address, config.httpd.listen));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM, letting `axum::serve` stop accepting new
/// connections while outstanding requests finish (§5 Cancellation and
/// timeouts: "the event loop is stopped after outstanding requests
/// complete or the shutdown grace period elapses" -- the per-request
/// timeout middleware already bounds that grace period).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
