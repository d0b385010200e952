use std::{env, net::SocketAddr};

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use crate::db::provider_accounts::Provider;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_DATABASE_URL: &str = "sqlite://sso.db?mode=rwc";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable `{0}` is not set")]
    MissingVar(&'static str),
    #[error("invalid value for environment variable `{0}`")]
    InvalidVar(&'static str),
    #[error("invalid URL in `{var}`: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct SsoConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub sentry_dsn: Option<String>,
    pub providers: Vec<ProviderConfig>,
}

/// Credentials and endpoints for one OAuth provider. The client id and secret
/// are consumed by the OAuth middleware that performs the handshake; this
/// service only validates them at startup.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: SecretString,
    pub callback_url: Url,
    pub scopes: Vec<String>,
    pub base_url: Url,
}

struct ProviderVars {
    provider: Provider,
    client_id: &'static str,
    client_secret: &'static str,
    callback_url: &'static str,
    scope: &'static str,
    base_url: &'static str,
    default_scope: &'static str,
    default_base_url: &'static str,
}

const PROVIDER_VARS: [ProviderVars; 3] = [
    ProviderVars {
        provider: Provider::GitHub,
        client_id: "GITHUB_CLIENT_ID",
        client_secret: "GITHUB_CLIENT_SECRET",
        callback_url: "GITHUB_CALLBACK_URL",
        scope: "GITHUB_SCOPE",
        base_url: "GITHUB_API_URL",
        default_scope: "read:user,user:email",
        default_base_url: "https://api.github.com",
    },
    ProviderVars {
        provider: Provider::GitLab,
        client_id: "GITLAB_CLIENT_ID",
        client_secret: "GITLAB_CLIENT_SECRET",
        callback_url: "GITLAB_CALLBACK_URL",
        scope: "GITLAB_SCOPE",
        base_url: "GITLAB_SITE",
        default_scope: "read_user",
        default_base_url: "https://gitlab.com",
    },
    ProviderVars {
        provider: Provider::Google,
        client_id: "GOOGLE_CLIENT_ID",
        client_secret: "GOOGLE_CLIENT_SECRET",
        callback_url: "GOOGLE_CALLBACK_URL",
        scope: "GOOGLE_SCOPE",
        base_url: "GOOGLE_API_URL",
        default_scope: "openid,email,profile",
        default_base_url: "https://openidconnect.googleapis.com",
    },
];

impl SsoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let listen_addr = get("SSO_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidVar("SSO_LISTEN_ADDR"))?;
        let database_url =
            get("SSO_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let sentry_dsn = get("SENTRY_DSN");

        let mut providers = Vec::new();
        for vars in &PROVIDER_VARS {
            // A provider is enabled by setting its client id.
            let Some(client_id) = get(vars.client_id) else {
                continue;
            };
            let client_secret = get(vars.client_secret)
                .map(|secret| SecretString::new(secret.into()))
                .ok_or(ConfigError::MissingVar(vars.client_secret))?;
            let callback_url = get(vars.callback_url)
                .ok_or(ConfigError::MissingVar(vars.callback_url))
                .and_then(|raw| parse_url(vars.callback_url, &raw))?;
            let scopes = parse_scopes(
                &get(vars.scope).unwrap_or_else(|| vars.default_scope.to_string()),
            );
            let base_url = parse_base_url(
                vars.base_url,
                &get(vars.base_url).unwrap_or_else(|| vars.default_base_url.to_string()),
            )?;

            providers.push(ProviderConfig {
                provider: vars.provider,
                client_id,
                client_secret,
                callback_url,
                scopes,
                base_url,
            });
        }

        Ok(Self {
            listen_addr,
            database_url,
            sentry_dsn,
            providers,
        })
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl { var, source })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConfigError::InvalidVar(var)),
    }
}

/// Endpoint paths are joined onto the base, so it must end with a slash for
/// self-hosted instances mounted under a sub-path.
fn parse_base_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        parse_url(var, trimmed)
    } else {
        parse_url(var, &format!("{trimmed}/"))
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .filter_map(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect()
}
