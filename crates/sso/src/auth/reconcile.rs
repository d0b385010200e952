use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::assertion::ExternalIdentityAssertion;
use crate::db::{
    is_busy, is_unique_violation,
    provider_accounts::{ProviderAccountError, create_provider_account, find_provider_account},
    users::{User, UserError, backfill_profile, create_user, find_user_by_email},
};

const MAX_RECONCILE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl From<UserError> for ReconcileError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::Validation(reason) => Self::Unauthorized(reason),
            UserError::Database(inner) => Self::Store(inner),
        }
    }
}

impl From<ProviderAccountError> for ReconcileError {
    fn from(err: ProviderAccountError) -> Self {
        match err {
            ProviderAccountError::Database(inner) => Self::Store(inner),
        }
    }
}

/// Maps a verified external identity onto exactly one local user and makes
/// sure that user is linked to the asserting provider.
#[derive(Clone)]
pub struct IdentityReconciler {
    pool: SqlitePool,
}

impl IdentityReconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A unique-index conflict means a concurrent login for the same email or
    /// link won the insert, and a busy store means another login held the
    /// write lock past the busy timeout. Either way the whole lookup is
    /// repeated so it sees the winner's rows.
    #[instrument(
        name = "identity.reconcile",
        skip_all,
        fields(provider = %assertion.provider)
    )]
    pub async fn reconcile(
        &self,
        assertion: &ExternalIdentityAssertion,
    ) -> Result<User, ReconcileError> {
        let mut attempt = 1;
        loop {
            match self.reconcile_once(assertion).await {
                Err(ReconcileError::Store(err))
                    if attempt < MAX_RECONCILE_ATTEMPTS
                        && (is_unique_violation(&err) || is_busy(&err)) =>
                {
                    warn!(attempt, "concurrent identity write detected, retrying lookup");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn reconcile_once(
        &self,
        assertion: &ExternalIdentityAssertion,
    ) -> Result<User, ReconcileError> {
        // Write lock is held from the lookup onward; concurrent logins for one
        // email serialize here. Dropping the transaction rolls back every step.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let Some(user) = find_user_by_email(&mut *tx, &assertion.email).await? else {
            let user = create_user(&mut *tx, assertion.new_user()).await?;
            create_provider_account(&mut *tx, assertion.provider_account(user.id)).await?;
            tx.commit().await?;

            info!(user_id = %user.id, "created user from provider login");
            return Ok(user);
        };

        let user = if user.needs_profile_backfill() {
            let updated = backfill_profile(&mut *tx, &user, assertion.profile_backfill()).await?;
            if updated != user {
                info!(user_id = %user.id, "backfilled missing profile fields");
            }
            updated
        } else {
            user
        };

        if find_provider_account(&mut *tx, user.id, assertion.provider)
            .await?
            .is_none()
        {
            create_provider_account(&mut *tx, assertion.provider_account(user.id)).await?;
            info!(user_id = %user.id, "linked provider account to existing user");
        }

        tx.commit().await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::{
        auth::provider::ProviderProfile,
        db::{
            count_rows, file_pool, memory_pool,
            provider_accounts::{NewProviderAccount, Provider},
            users::NewUser,
        },
    };

    const AVATAR: &str = "https://gitlab.com/uploads/-/system/user/avatar/7/avatar.png";

    fn assertion(provider: Provider, email: &str) -> ExternalIdentityAssertion {
        ExternalIdentityAssertion::from_profile(
            provider,
            ProviderProfile {
                id: "7".into(),
                emails: vec![email.into()],
                display_name: Some("Ada Lovelace".into()),
                avatar_url: Some(AVATAR.into()),
            },
            SecretString::new("access-token".into()),
            Some(SecretString::new("refresh-token".into())),
        )
        .unwrap()
    }

    async fn magic_link_user(pool: &SqlitePool, email: &str) -> User {
        create_user(
            pool,
            NewUser {
                email,
                display_name: None,
                photo_url: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn creates_user_and_link_for_unknown_email() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());

        let user = reconciler
            .reconcile(&assertion(Provider::GitLab, "ada@example.com"))
            .await
            .unwrap();

        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(user.photo_url.as_deref(), Some(AVATAR));
        assert_eq!(count_rows(&pool, "users").await, 1);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 1);

        let link = find_provider_account(&pool, user.id, Provider::GitLab)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.provider_account_id, "7");
        assert_eq!(link.access_token, "access-token");
        assert_eq!(link.refresh_token.as_deref(), Some("refresh-token"));
    }

    #[tokio::test]
    async fn complete_profile_with_existing_link_is_untouched() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let first = reconciler
            .reconcile(&assertion(Provider::GitLab, "ada@example.com"))
            .await
            .unwrap();

        let mut renamed = assertion(Provider::GitLab, "ada@example.com");
        renamed.display_name = Some("Someone Else".into());
        let second = reconciler.reconcile(&renamed).await.unwrap();

        assert_eq!(second, first);
        assert_eq!(count_rows(&pool, "users").await, 1);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 1);
    }

    #[tokio::test]
    async fn backfills_magic_link_user_once() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let existing = magic_link_user(&pool, "ada@example.com").await;
        let login = assertion(Provider::GitLab, "ada@example.com");

        let updated = reconciler.reconcile(&login).await.unwrap();
        assert_eq!(updated.id, existing.id);
        assert_eq!(updated.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(updated.photo_url.as_deref(), Some(AVATAR));

        let again = reconciler.reconcile(&login).await.unwrap();
        assert_eq!(again, updated);
        assert_eq!(count_rows(&pool, "users").await, 1);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 1);
    }

    #[tokio::test]
    async fn links_second_provider_without_new_user() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let via_gitlab = reconciler
            .reconcile(&assertion(Provider::GitLab, "ada@example.com"))
            .await
            .unwrap();

        let via_github = reconciler
            .reconcile(&assertion(Provider::GitHub, "ADA@example.com"))
            .await
            .unwrap();

        assert_eq!(via_github.id, via_gitlab.id);
        assert_eq!(count_rows(&pool, "users").await, 1);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 2);
        assert!(
            find_provider_account(&pool, via_gitlab.id, Provider::GitHub)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn existing_link_from_other_flow_is_reused() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let existing = magic_link_user(&pool, "ada@example.com").await;
        create_provider_account(
            &pool,
            NewProviderAccount {
                user_id: existing.id,
                provider: Provider::GitLab,
                provider_account_id: "7",
                access_token: "older-token",
                refresh_token: None,
            },
        )
        .await
        .unwrap();

        reconciler
            .reconcile(&assertion(Provider::GitLab, "ada@example.com"))
            .await
            .unwrap();

        assert_eq!(count_rows(&pool, "provider_accounts").await, 1);
        let link = find_provider_account(&pool, existing.id, Provider::GitLab)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.access_token, "older-token");
    }

    #[tokio::test]
    async fn rejected_backfill_aborts_before_linking() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let existing = magic_link_user(&pool, "ada@example.com").await;

        let mut login = assertion(Provider::GitLab, "ada@example.com");
        login.avatar_url = Some("data:image/png;base64,AAAA".into());

        let err = reconciler.reconcile(&login).await.unwrap_err();
        match err {
            ReconcileError::Unauthorized(reason) => assert!(reason.contains("photo URL")),
            other => panic!("expected unauthorized, got {other:?}"),
        }

        assert_eq!(count_rows(&pool, "provider_accounts").await, 0);
        let stored = find_user_by_email(&pool, "ada@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, existing);
    }

    #[tokio::test]
    async fn invalid_profile_rejects_first_login() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());

        let mut login = assertion(Provider::GitLab, "ada@example.com");
        login.avatar_url = Some("gitlab-avatar.png".into());

        let err = reconciler.reconcile(&login).await.unwrap_err();
        match err {
            ReconcileError::Unauthorized(reason) => assert!(reason.contains("photo URL")),
            other => panic!("expected unauthorized, got {other:?}"),
        }
        assert_eq!(count_rows(&pool, "users").await, 0);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 0);
    }

    #[tokio::test]
    async fn repeated_login_is_idempotent() {
        let pool = memory_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let login = assertion(Provider::Google, "ada@example.com");

        let first = reconciler.reconcile(&login).await.unwrap();
        let second = reconciler.reconcile(&login).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(count_rows(&pool, "users").await, 1);
        assert_eq!(count_rows(&pool, "provider_accounts").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_logins_share_one_user() {
        let (_dir, pool) = file_pool().await;
        let reconciler = IdentityReconciler::new(pool.clone());
        let rounds = 10;

        for round in 0..rounds {
            let email = format!("user{round}@example.com");
            let handles: Vec<_> = [
                Provider::GitLab,
                Provider::GitHub,
                Provider::Google,
                Provider::GitLab,
            ]
            .into_iter()
            .map(|provider| {
                let reconciler = reconciler.clone();
                let email = email.clone();
                tokio::spawn(async move {
                    reconciler.reconcile(&assertion(provider, &email)).await
                })
            })
            .collect();

            let mut user_ids = Vec::new();
            for handle in handles {
                let user = handle.await.unwrap().unwrap();
                user_ids.push(user.id);
            }
            user_ids.dedup();
            assert_eq!(user_ids.len(), 1, "round {round} produced several users");

            for provider in [Provider::GitLab, Provider::GitHub, Provider::Google] {
                assert!(
                    find_provider_account(&pool, user_ids[0], provider)
                        .await
                        .unwrap()
                        .is_some()
                );
            }
        }

        assert_eq!(count_rows(&pool, "users").await, rounds);
        assert_eq!(count_rows(&pool, "provider_accounts").await, rounds * 3);
    }
}
