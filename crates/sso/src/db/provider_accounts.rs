use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite, Type, query_as};
use thiserror::Error;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::GitHub, Provider::GitLab, Provider::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str().eq_ignore_ascii_case(input.trim()))
            .ok_or_else(|| UnknownProvider(input.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ProviderAccountError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Clone, sqlx::FromRow)]
pub struct ProviderAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for ProviderAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAccount")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("provider_account_id", &self.provider_account_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct NewProviderAccount<'a> {
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_account_id: &'a str,
    pub access_token: &'a str,
    pub refresh_token: Option<&'a str>,
}

pub async fn find_provider_account<'e, E>(
    executor: E,
    user_id: Uuid,
    provider: Provider,
) -> Result<Option<ProviderAccount>, ProviderAccountError>
where
    E: Executor<'e, Database = Sqlite>,
{
    query_as::<_, ProviderAccount>(
        r#"
        SELECT id, user_id, provider, provider_account_id, access_token, refresh_token, created_at
        FROM provider_accounts
        WHERE user_id = ?1 AND provider = ?2
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .fetch_optional(executor)
    .await
    .map_err(ProviderAccountError::from)
}

pub async fn create_provider_account<'e, E>(
    executor: E,
    account: NewProviderAccount<'_>,
) -> Result<ProviderAccount, ProviderAccountError>
where
    E: Executor<'e, Database = Sqlite>,
{
    query_as::<_, ProviderAccount>(
        r#"
        INSERT INTO provider_accounts (
            id,
            user_id,
            provider,
            provider_account_id,
            access_token,
            refresh_token,
            created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING id, user_id, provider, provider_account_id, access_token, refresh_token, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account.user_id)
    .bind(account.provider)
    .bind(account.provider_account_id)
    .bind(account.access_token)
    .bind(account.refresh_token)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .map_err(ProviderAccountError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        is_unique_violation, memory_pool,
        users::{NewUser, create_user},
    };

    #[test]
    fn provider_parsing_is_case_insensitive() {
        assert_eq!("GitLab".parse::<Provider>().unwrap(), Provider::GitLab);
        assert_eq!(" github ".parse::<Provider>().unwrap(), Provider::GitHub);
        assert!("bitbucket".parse::<Provider>().is_err());
        assert_eq!(Provider::Google.to_string(), "google");
    }

    #[tokio::test]
    async fn one_link_per_user_and_provider() {
        let pool = memory_pool().await;
        let user = create_user(
            &pool,
            NewUser {
                email: "ada@example.com",
                display_name: None,
                photo_url: None,
            },
        )
        .await
        .unwrap();

        let link = NewProviderAccount {
            user_id: user.id,
            provider: Provider::GitLab,
            provider_account_id: "42",
            access_token: "glpat-first",
            refresh_token: Some("refresh-first"),
        };
        let stored = create_provider_account(&pool, link.clone()).await.unwrap();
        assert_eq!(stored.provider, Provider::GitLab);
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-first"));

        let ProviderAccountError::Database(err) = create_provider_account(&pool, link)
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));

        let found = find_provider_account(&pool, user.id, Provider::GitLab)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, stored.id);
        assert!(
            find_provider_account(&pool, user.id, Provider::GitHub)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn debug_output_hides_tokens() {
        let account = ProviderAccount {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: Provider::GitHub,
            provider_account_id: "7".into(),
            access_token: "gho_secret".into(),
            refresh_token: Some("ghr_secret".into()),
            created_at: Utc::now(),
        };
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("gho_secret"));
        assert!(!rendered.contains("ghr_secret"));
    }
}
