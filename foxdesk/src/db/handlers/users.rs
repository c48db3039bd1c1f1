//! Database repository for users.

use crate::types::{OrganizationId, UserId, abbrev_uuid};
use crate::{
    api::models::users::Role,
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
    },
    types::Operation,
};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const USER_COLUMNS: &str =
    "id, email, display_name, role, organization_id, password_hash, is_active, notify_by_email, auth_source, created_at, updated_at, last_login";

/// Filter for listing users
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub skip: i64,
    pub limit: i64,
    pub search: Option<String>,
    pub role: Option<Role>,
    pub organization_id: Option<OrganizationId>,
}

impl UserFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            skip,
            limit,
            ..Default::default()
        }
    }
}

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

fn push_user_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    builder.push(" WHERE 1=1");
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.to_lowercase());
        builder.push(" AND (LOWER(email) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(COALESCE(display_name, '')) LIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
    if let Some(role) = filter.role {
        builder.push(" AND role = ");
        builder.push_bind(role);
    }
    if let Some(organization_id) = filter.organization_id {
        builder.push(" AND organization_id = ");
        builder.push_bind(organization_id);
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type CreateRequest = UserCreateDBRequest;
    type UpdateRequest = UserUpdateDBRequest;
    type Response = UserDBResponse;
    type Id = UserId;
    type Filter = UserFilter;

    #[instrument(skip(self, request), fields(email = %request.email, role = ?request.role), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let user = sqlx::query_as::<_, UserDBResponse>(&format!(
            r#"
            INSERT INTO users (email, display_name, role, organization_id, password_hash, notify_by_email, auth_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(request.email.trim())
        .bind(&request.display_name)
        .bind(request.role)
        .bind(request.organization_id)
        .bind(&request.password_hash)
        .bind(request.notify_by_email)
        .bind(&request.auth_source)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let user = sqlx::query_as::<_, UserDBResponse>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(user)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let users = sqlx::query_as::<_, UserDBResponse>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(users.into_iter().map(|u| (u.id, u)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_user_filters(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.skip);

        let users = builder.build_query_as::<UserDBResponse>().fetch_all(&mut *self.db).await?;
        Ok(users)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let requested: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets WHERE requester_id = $1")
            .bind(id)
            .fetch_one(&mut *self.db)
            .await?;

        if requested > 0 {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: format!("user has requested {requested} tickets; deactivate the account instead"),
                entity_type: "user".to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let result = sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let user = sqlx::query_as::<_, UserDBResponse>(&format!(
            r#"
            UPDATE users SET
                email = COALESCE($2, email),
                display_name = COALESCE($3, display_name),
                role = COALESCE($4, role),
                organization_id = CASE WHEN $5 THEN NULL ELSE COALESCE($6, organization_id) END,
                is_active = COALESCE($7, is_active),
                notify_by_email = COALESCE($8, notify_by_email),
                password_hash = COALESCE($9, password_hash),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.email.as_deref().map(str::trim))
        .bind(&request.display_name)
        .bind(request.role)
        .bind(request.clear_organization)
        .bind(request.organization_id)
        .bind(request.is_active)
        .bind(request.notify_by_email)
        .bind(&request.password_hash)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(user)
    }
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Total number of users matching the filter, ignoring pagination.
    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &UserFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users");
        push_user_filters(&mut builder, filter);
        let count = builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?;
        Ok(count)
    }

    /// Case-insensitive lookup by email address.
    #[instrument(skip(self), err)]
    pub async fn get_user_by_email(&mut self, email: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, UserDBResponse>(&format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"))
            .bind(email.trim())
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(user)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    pub async fn touch_last_login(&mut self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn create_request(email: &str, role: Role) -> UserCreateDBRequest {
        UserCreateDBRequest {
            email: email.to_string(),
            display_name: Some("Test User".to_string()),
            role,
            organization_id: None,
            password_hash: None,
            notify_by_email: true,
            auth_source: "native".to_string(),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_get_user(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        let user = repo.create(&create_request("Jane@Example.com", Role::Agent)).await.unwrap();
        assert_eq!(user.role, Role::Agent);
        assert!(user.is_active);

        let fetched = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(fetched.email, "Jane@Example.com");

        let by_email = repo.get_user_by_email("jane@example.COM").await.unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_email_is_unique_violation(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        repo.create(&create_request("dup@example.com", Role::User)).await.unwrap();
        let err = repo.create(&create_request("DUP@example.com", Role::User)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_and_count_with_filters(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        repo.create(&create_request("alice@example.com", Role::User)).await.unwrap();
        repo.create(&create_request("bob@example.com", Role::Agent)).await.unwrap();
        repo.create(&create_request("carol@other.org", Role::User)).await.unwrap();

        let filter = UserFilter {
            search: Some("example".to_string()),
            ..UserFilter::new(0, 10)
        };
        assert_eq!(repo.list(&filter).await.unwrap().len(), 2);
        assert_eq!(repo.count(&filter).await.unwrap(), 2);

        let filter = UserFilter {
            role: Some(Role::User),
            ..UserFilter::new(0, 1)
        };
        assert_eq!(repo.list(&filter).await.unwrap().len(), 1);
        assert_eq!(repo.count(&filter).await.unwrap(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_user(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        let user = repo.create(&create_request("update@example.com", Role::User)).await.unwrap();
        let updated = repo
            .update(
                user.id,
                &UserUpdateDBRequest {
                    display_name: Some("Renamed".to_string()),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.display_name.as_deref(), Some("Renamed"));
        assert!(!updated.is_active);
        assert_eq!(updated.email, "update@example.com");

        let missing = repo.update(uuid::Uuid::new_v4(), &UserUpdateDBRequest::default()).await;
        assert!(matches!(missing, Err(DbError::NotFound)));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_user(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        let user = repo.create(&create_request("gone@example.com", Role::User)).await.unwrap();
        assert!(repo.delete(user.id).await.unwrap());
        assert!(repo.get_by_id(user.id).await.unwrap().is_none());
        assert!(!repo.delete(user.id).await.unwrap());
    }
}
