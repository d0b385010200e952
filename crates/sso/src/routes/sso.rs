use std::borrow::Cow;

use api_types::sso::{
    CallbackRequest, CallbackResponse, ProviderInfo, ProvidersResponse, UserResponse,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use secrecy::SecretString;
use tracing::{error, info, instrument, warn};

use super::error::ErrorResponse;
use crate::{
    AppState,
    auth::{AssertionError, ReconcileError, SsoLoginError},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sso/providers", get(list_providers))
        .route("/sso/{provider}/callback", post(callback))
}

pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let providers = state
        .providers()
        .iter()
        .map(|provider| {
            let config = provider.config();
            ProviderInfo {
                provider: provider.kind().to_string(),
                client_id: config.client_id.clone(),
                callback_url: config.callback_url.to_string(),
                scopes: config.scopes.clone(),
            }
        })
        .collect();

    Json(ProvidersResponse { providers })
}

#[instrument(name = "sso.callback", skip(state, payload))]
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(payload): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, ErrorResponse> {
    let access_token = SecretString::new(payload.access_token.into());
    let refresh_token = payload
        .refresh_token
        .map(|token| SecretString::new(token.into()));

    match state
        .login()
        .complete(&provider, access_token, refresh_token)
        .await
    {
        Ok(user) => {
            info!(user_id = %user.id, "provider login completed");
            Ok(Json(CallbackResponse {
                user: UserResponse::from(user),
            }))
        }
        Err(error) => Err(login_error_response(error)),
    }
}

fn login_error_response(error: SsoLoginError) -> ErrorResponse {
    match &error {
        SsoLoginError::Reconcile(ReconcileError::Store(err)) => {
            error!(?err, "store failure during provider login")
        }
        SsoLoginError::Provider(err) => warn!(?err, "provider error during login"),
        SsoLoginError::Reconcile(ReconcileError::Unauthorized(reason)) => {
            warn!(%reason, "login rejected")
        }
        SsoLoginError::Assertion(err) => warn!(%err, "provider profile rejected"),
        SsoLoginError::UnsupportedProvider(_) => {}
    }

    let (status, code) = classify_login_error(&error);
    let response = ErrorResponse::new(status, code);
    match error {
        SsoLoginError::Reconcile(ReconcileError::Unauthorized(reason)) => {
            response.with_message(reason)
        }
        _ => response,
    }
}

fn classify_login_error(error: &SsoLoginError) -> (StatusCode, Cow<'static, str>) {
    match error {
        SsoLoginError::UnsupportedProvider(_) => (
            StatusCode::BAD_REQUEST,
            Cow::Borrowed("unsupported_provider"),
        ),
        SsoLoginError::Provider(_) => (StatusCode::UNAUTHORIZED, Cow::Borrowed("provider_error")),
        SsoLoginError::Assertion(AssertionError::MissingEmail(_)) => {
            (StatusCode::UNAUTHORIZED, Cow::Borrowed("missing_email"))
        }
        SsoLoginError::Assertion(AssertionError::MissingAccountId(_)) => {
            (StatusCode::UNAUTHORIZED, Cow::Borrowed("invalid_profile"))
        }
        SsoLoginError::Reconcile(ReconcileError::Unauthorized(_)) => {
            (StatusCode::UNAUTHORIZED, Cow::Borrowed("unauthorized"))
        }
        // Store failures stay opaque to the caller.
        SsoLoginError::Reconcile(ReconcileError::Store(_)) => (
            StatusCode::UNAUTHORIZED,
            Cow::Borrowed("authentication_failed"),
        ),
    }
}
