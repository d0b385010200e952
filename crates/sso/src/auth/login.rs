use std::{sync::Arc, time::Duration};

use anyhow::Error as AnyhowError;
use reqwest::StatusCode;
use secrecy::SecretString;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{instrument, warn};

use super::{
    assertion::{AssertionError, ExternalIdentityAssertion},
    provider::{IdentityProvider, ProviderProfile, ProviderRegistry},
    reconcile::{IdentityReconciler, ReconcileError},
};
use crate::{
    configure_user_scope,
    db::{provider_accounts::Provider, users::User},
};

const PROFILE_FETCH_MAX_ATTEMPTS: usize = 3;
const PROFILE_FETCH_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SsoLoginError {
    #[error("unsupported provider `{0}`")]
    UnsupportedProvider(String),
    #[error(transparent)]
    Provider(AnyhowError),
    #[error(transparent)]
    Assertion(#[from] AssertionError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Completes a provider login once the OAuth middleware holds the provider's
/// tokens: fetches the profile, builds the assertion and reconciles it.
pub struct SsoLoginService {
    providers: Arc<ProviderRegistry>,
    reconciler: IdentityReconciler,
}

impl SsoLoginService {
    pub fn new(providers: Arc<ProviderRegistry>, reconciler: IdentityReconciler) -> Self {
        Self {
            providers,
            reconciler,
        }
    }

    #[instrument(name = "sso.complete_login", skip(self, access_token, refresh_token))]
    pub async fn complete(
        &self,
        provider: &str,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) -> Result<User, SsoLoginError> {
        let kind: Provider = provider
            .parse()
            .map_err(|_| SsoLoginError::UnsupportedProvider(provider.to_string()))?;
        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| SsoLoginError::UnsupportedProvider(kind.to_string()))?;

        let profile = Self::fetch_profile(provider.as_ref(), &access_token).await?;
        let assertion =
            ExternalIdentityAssertion::from_profile(kind, profile, access_token, refresh_token)?;
        let user = self.reconciler.reconcile(&assertion).await?;

        configure_user_scope(&user.id, user.display_name.as_deref(), Some(&user.email));
        Ok(user)
    }

    async fn fetch_profile(
        provider: &dyn IdentityProvider,
        access_token: &SecretString,
    ) -> Result<ProviderProfile, SsoLoginError> {
        let mut attempt = 1;
        loop {
            match provider.fetch_profile(access_token).await {
                Ok(profile) => return Ok(profile),
                Err(err) if attempt < PROFILE_FETCH_MAX_ATTEMPTS && is_forbidden_error(&err) => {
                    warn!(
                        provider = %provider.kind(),
                        attempt,
                        "provider refused profile request, retrying"
                    );
                    attempt += 1;
                    sleep(Duration::from_millis(PROFILE_FETCH_RETRY_DELAY_MS)).await;
                }
                Err(err) => {
                    warn!(
                        provider = %provider.kind(),
                        attempts = attempt,
                        error = ?err,
                        "failed to fetch provider profile"
                    );
                    return Err(SsoLoginError::Provider(err));
                }
            }
        }
    }
}

// Freshly issued tokens are sometimes rejected for a moment after the
// handshake.
fn is_forbidden_error(err: &AnyhowError) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .and_then(|req_err| req_err.status())
            .map(|status| status == StatusCode::FORBIDDEN)
            .unwrap_or(false)
    })
}
