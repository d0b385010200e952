use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use uuid::Uuid;

use super::provider::ProviderProfile;
use crate::db::{
    provider_accounts::{NewProviderAccount, Provider},
    users::{NewUser, ProfileBackfill},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssertionError {
    #[error("{0} profile has no email address")]
    MissingEmail(Provider),
    #[error("{0} profile has no account id")]
    MissingAccountId(Provider),
}

/// Verified identity claims for one login attempt. Built from a provider
/// profile after the OAuth handshake and never persisted as such.
#[derive(Debug, Clone)]
pub struct ExternalIdentityAssertion {
    pub provider: Provider,
    pub provider_account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
}

impl ExternalIdentityAssertion {
    pub fn from_profile(
        provider: Provider,
        profile: ProviderProfile,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) -> Result<Self, AssertionError> {
        let provider_account_id = profile.id.trim().to_string();
        if provider_account_id.is_empty() {
            return Err(AssertionError::MissingAccountId(provider));
        }

        let email = profile
            .emails
            .into_iter()
            .map(|email| normalize_email(&email))
            .find(|email| !email.is_empty())
            .ok_or(AssertionError::MissingEmail(provider))?;

        Ok(Self {
            provider,
            provider_account_id,
            email,
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
            access_token,
            refresh_token,
        })
    }

    pub(crate) fn new_user(&self) -> NewUser<'_> {
        NewUser {
            email: &self.email,
            display_name: self.display_name.as_deref(),
            photo_url: self.avatar_url.as_deref(),
        }
    }

    pub(crate) fn profile_backfill(&self) -> ProfileBackfill<'_> {
        ProfileBackfill {
            display_name: self.display_name.as_deref(),
            photo_url: self.avatar_url.as_deref(),
        }
    }

    pub(crate) fn provider_account(&self, user_id: Uuid) -> NewProviderAccount<'_> {
        NewProviderAccount {
            user_id,
            provider: self.provider,
            provider_account_id: &self.provider_account_id,
            access_token: self.access_token.expose_secret(),
            refresh_token: self.refresh_token.as_ref().map(|token| token.expose_secret()),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
