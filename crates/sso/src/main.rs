use anyhow::Context;
use sso::{
    AppState, auth::ProviderRegistry, config::SsoConfig, db, init_sentry, init_tracing, routes,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SsoConfig::from_env().context("invalid configuration")?;
    let _sentry = init_sentry(config.sentry_dsn.as_deref()).context("invalid SENTRY_DSN")?;
    init_tracing();

    let pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database `{}`", config.database_url))?;

    let providers = ProviderRegistry::from_configs(&config.providers)?;
    if providers.is_empty() {
        warn!("no OAuth providers configured; every callback will be rejected");
    }
    for provider in providers.iter() {
        info!(provider = %provider.kind(), "provider enabled");
    }

    let listen_addr = config.listen_addr;
    let app = routes::router(AppState::new(pool, providers));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "sso server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(?error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
