//! Database repository for password reset tokens.
//!
//! Only a digest of each token is stored; the raw token exists in the reset email alone.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::password,
    db::{errors::Result, models::password_reset_tokens::PasswordResetToken},
    types::{UserId, abbrev_uuid},
};

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, expires_at, created_at, used_at";

pub struct PasswordResetTokens<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PasswordResetTokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Store a new token for a user. Earlier unused tokens stop working.
    #[instrument(skip(self, raw_token), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn create(&mut self, user_id: UserId, raw_token: &str, expires_at: DateTime<Utc>) -> Result<PasswordResetToken> {
        self.invalidate_for_user(user_id).await?;

        let token = sqlx::query_as::<_, PasswordResetToken>(&format!(
            "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3) RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(user_id)
        .bind(password::token_digest(raw_token))
        .bind(expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(token)
    }

    /// Look up a raw token, returning it only while unused and unexpired.
    #[instrument(skip(self, raw_token), err)]
    pub async fn find_valid(&mut self, raw_token: &str) -> Result<Option<PasswordResetToken>> {
        let token = sqlx::query_as::<_, PasswordResetToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM password_reset_tokens WHERE token_hash = $1"
        ))
        .bind(password::token_digest(raw_token))
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(token.filter(|t| t.is_usable(Utc::now())))
    }

    /// Mark a token used. Returns false if it was already used.
    #[instrument(skip(self), err)]
    pub async fn mark_used(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE password_reset_tokens SET used_at = NOW() WHERE id = $1 AND used_at IS NULL")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn invalidate_for_user(&mut self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query("UPDATE password_reset_tokens SET used_at = NOW() WHERE user_id = $1 AND used_at IS NULL")
            .bind(user_id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::models::users::Role, test_utils::create_test_user};
    use chrono::Duration;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_token_lifecycle(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PasswordResetTokens::new(&mut conn);

        let raw = password::generate_reset_token();
        let token = repo.create(user.id, &raw, Utc::now() + Duration::minutes(30)).await.unwrap();
        assert_ne!(token.token_hash, raw);

        let found = repo.find_valid(&raw).await.unwrap().unwrap();
        assert_eq!(found.id, token.id);
        assert!(repo.find_valid("not-a-token").await.unwrap().is_none());

        assert!(repo.mark_used(token.id).await.unwrap());
        assert!(!repo.mark_used(token.id).await.unwrap());
        assert!(repo.find_valid(&raw).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_new_token_invalidates_old_and_expiry(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = PasswordResetTokens::new(&mut conn);

        let first = password::generate_reset_token();
        repo.create(user.id, &first, Utc::now() + Duration::minutes(30)).await.unwrap();
        let second = password::generate_reset_token();
        repo.create(user.id, &second, Utc::now() + Duration::minutes(30)).await.unwrap();

        assert!(repo.find_valid(&first).await.unwrap().is_none());
        assert!(repo.find_valid(&second).await.unwrap().is_some());

        let expired = password::generate_reset_token();
        repo.create(user.id, &expired, Utc::now() - Duration::minutes(1)).await.unwrap();
        assert!(repo.find_valid(&expired).await.unwrap().is_none());
    }
}
