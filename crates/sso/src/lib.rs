pub mod auth;
pub mod config;
pub mod db;
pub mod routes;
mod state;

pub use state::AppState;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`),
/// JSON lines when `LOG_FORMAT=json`, and a Sentry layer that is inert until
/// a Sentry client is bound.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|value| value.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .with(sentry_tracing::layer())
        .init();
}

pub fn init_sentry(
    dsn: Option<&str>,
) -> Result<Option<sentry::ClientInitGuard>, sentry::types::ParseDsnError> {
    let Some(dsn) = dsn else {
        return Ok(None);
    };
    let dsn: sentry::types::Dsn = dsn.parse()?;
    Ok(Some(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        send_default_pii: false,
        ..Default::default()
    })))
}

pub fn configure_user_scope(user_id: &Uuid, username: Option<&str>, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            username: username.map(str::to_owned),
            email: email.map(str::to_owned),
            ..Default::default()
        }));
    });
}
