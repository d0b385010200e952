use api_types::sso::UserResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite, query_as};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

const DISPLAY_NAME_MAX_CHARS: usize = 100;
const PHOTO_URL_MAX_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("invalid profile: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Users who signed up through a magic link have neither field yet.
    pub fn needs_profile_backfill(&self) -> bool {
        is_blank(self.display_name.as_deref()) || is_blank(self.photo_url.as_deref())
    }
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            display_name: user.display_name,
            photo_url: user.photo_url,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub display_name: Option<&'a str>,
    pub photo_url: Option<&'a str>,
}

/// Profile values offered by a later login. Only fields the user is missing
/// are taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileBackfill<'a> {
    pub display_name: Option<&'a str>,
    pub photo_url: Option<&'a str>,
}

pub async fn find_user_by_email<'e, E>(executor: E, email: &str) -> Result<Option<User>, UserError>
where
    E: Executor<'e, Database = Sqlite>,
{
    query_as::<_, User>(
        r#"
        SELECT id, email, display_name, photo_url, created_at, updated_at
        FROM users
        WHERE email = ?1 COLLATE NOCASE
        "#,
    )
    .bind(email)
    .fetch_optional(executor)
    .await
    .map_err(UserError::from)
}

pub async fn create_user<'e, E>(executor: E, user: NewUser<'_>) -> Result<User, UserError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let display_name = non_blank(user.display_name);
    let photo_url = non_blank(user.photo_url);
    validate_profile(display_name, photo_url)?;

    let now = Utc::now();
    query_as::<_, User>(
        r#"
        INSERT INTO users (id, email, display_name, photo_url, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        RETURNING id, email, display_name, photo_url, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.email)
    .bind(display_name)
    .bind(photo_url)
    .bind(now)
    .fetch_one(executor)
    .await
    .map_err(UserError::from)
}

/// Fills in `display_name` and `photo_url` where the stored user has none.
/// Present values are never overwritten, and nothing is written when there is
/// nothing to fill, so applying the same backfill twice is a no-op.
pub async fn backfill_profile<'e, E>(
    executor: E,
    user: &User,
    source: ProfileBackfill<'_>,
) -> Result<User, UserError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let display_name = is_blank(user.display_name.as_deref())
        .then(|| non_blank(source.display_name))
        .flatten();
    let photo_url = is_blank(user.photo_url.as_deref())
        .then(|| non_blank(source.photo_url))
        .flatten();

    if display_name.is_none() && photo_url.is_none() {
        return Ok(user.clone());
    }

    validate_profile(display_name, photo_url)?;

    query_as::<_, User>(
        r#"
        UPDATE users
        SET display_name = COALESCE(?2, display_name),
            photo_url = COALESCE(?3, photo_url),
            updated_at = ?4
        WHERE id = ?1
        RETURNING id, email, display_name, photo_url, created_at, updated_at
        "#,
    )
    .bind(user.id)
    .bind(display_name)
    .bind(photo_url)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .map_err(UserError::from)
}

fn validate_profile(display_name: Option<&str>, photo_url: Option<&str>) -> Result<(), UserError> {
    if let Some(name) = display_name {
        validate_display_name(name)?;
    }
    if let Some(url) = photo_url {
        validate_photo_url(url)?;
    }
    Ok(())
}

pub fn validate_display_name(name: &str) -> Result<(), UserError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > DISPLAY_NAME_MAX_CHARS {
        return Err(UserError::Validation(format!(
            "display name must be between 1 and {DISPLAY_NAME_MAX_CHARS} characters"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(UserError::Validation(
            "display name must not contain control characters".into(),
        ));
    }
    Ok(())
}

pub fn validate_photo_url(value: &str) -> Result<(), UserError> {
    if value.len() > PHOTO_URL_MAX_LEN {
        return Err(UserError::Validation(format!(
            "photo URL must be at most {PHOTO_URL_MAX_LEN} characters"
        )));
    }
    let url = Url::parse(value)
        .map_err(|err| UserError::Validation(format!("photo URL is not a valid URL: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(UserError::Validation(format!(
            "photo URL scheme `{other}` is not allowed"
        ))),
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
