use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::{config::ProviderConfig, db::provider_accounts::Provider};

const USER_AGENT: &str = "SsoIdentity/1.0";

/// Profile fields every provider adapter maps its own user document into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub id: String,
    pub emails: Vec<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> Provider;
    fn config(&self) -> &ProviderConfig;
    async fn fetch_profile(&self, access_token: &SecretString) -> Result<ProviderProfile>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<Provider, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            match config.provider {
                Provider::GitHub => registry.register(GitHubProvider::new(config.clone())?),
                Provider::GitLab => registry.register(GitLabProvider::new(config.clone())?),
                Provider::Google => registry.register(GoogleProvider::new(config.clone())?),
            }
        }
        Ok(registry)
    }

    pub fn register<P>(&mut self, provider: P)
    where
        P: IdentityProvider + 'static,
    {
        self.providers.insert(provider.kind(), Arc::new(provider));
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.get(&provider).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IdentityProvider>> {
        self.providers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build provider HTTP client")
}

fn endpoint(config: &ProviderConfig, path: &str) -> Result<Url> {
    config
        .base_url
        .join(path)
        .with_context(|| format!("invalid {} endpoint `{path}`", config.provider))
}

pub struct GitLabProvider {
    client: Client,
    config: ProviderConfig,
}

impl GitLabProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    id: i64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    public_email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[async_trait]
impl IdentityProvider for GitLabProvider {
    fn kind(&self) -> Provider {
        Provider::GitLab
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn fetch_profile(&self, access_token: &SecretString) -> Result<ProviderProfile> {
        let user: GitLabUser = self
            .client
            .get(endpoint(&self.config, "api/v4/user")?)
            .bearer_auth(access_token.expose_secret())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse GitLab user response")?;

        Ok(ProviderProfile {
            id: user.id.to_string(),
            emails: user.email.into_iter().chain(user.public_email).collect(),
            display_name: user.name,
            avatar_url: user.avatar_url,
        })
    }
}

pub struct GitHubProvider {
    client: Client,
    config: ProviderConfig,
}

impl GitHubProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    email: Option<String>,
    name: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn kind(&self) -> Provider {
        Provider::GitHub
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn fetch_profile(&self, access_token: &SecretString) -> Result<ProviderProfile> {
        let user: GitHubUser = self
            .client
            .get(endpoint(&self.config, "user")?)
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(access_token.expose_secret())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse GitHub user response")?;

        let email = if user.email.is_some() {
            user.email
        } else {
            let response = self
                .client
                .get(endpoint(&self.config, "user/emails")?)
                .header("Accept", "application/vnd.github+json")
                .bearer_auth(access_token.expose_secret())
                .send()
                .await?;

            if response.status().is_success() {
                let emails: Vec<GitHubEmail> = response
                    .json()
                    .await
                    .context("failed to parse GitHub email response")?;
                emails
                    .into_iter()
                    .find(|entry| entry.primary && entry.verified)
                    .map(|entry| entry.email)
            } else {
                None
            }
        };

        Ok(ProviderProfile {
            id: user.id.to_string(),
            emails: email.into_iter().collect(),
            display_name: user.name.or(Some(user.login)),
            avatar_url: user.avatar_url,
        })
    }
}

pub struct GoogleProvider {
    client: Client,
    config: ProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn kind(&self) -> Provider {
        Provider::Google
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn fetch_profile(&self, access_token: &SecretString) -> Result<ProviderProfile> {
        let profile: GoogleUser = self
            .client
            .get(endpoint(&self.config, "v1/userinfo")?)
            .bearer_auth(access_token.expose_secret())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse Google userinfo response")?;

        let name = profile
            .name
            .or_else(|| match (profile.given_name, profile.family_name) {
                (Some(first), Some(last)) => Some(format!("{first} {last}")),
                (Some(first), None) => Some(first),
                (None, Some(last)) => Some(last),
                (None, None) => None,
            });

        // Unverified addresses must not be used to match existing users.
        let email = profile
            .email
            .filter(|_| profile.email_verified.unwrap_or(false));

        Ok(ProviderProfile {
            id: profile.sub,
            emails: email.into_iter().collect(),
            display_name: name,
            avatar_url: profile.picture,
        })
    }
}
