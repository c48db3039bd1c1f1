//! Database repository for organizations.

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::organizations::{OrganizationCreateDBRequest, OrganizationDBResponse, OrganizationUpdateDBRequest},
    },
    types::{Operation, OrganizationId, abbrev_uuid},
};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const ORGANIZATION_COLUMNS: &str = "id, name, email_domain, billable_rate, is_active, notes, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct OrganizationFilter {
    pub skip: i64,
    pub limit: i64,
    pub search: Option<String>,
    pub active_only: bool,
}

pub struct Organizations<'c> {
    db: &'c mut PgConnection,
}

/// Lower-case a domain and drop a leading `@`.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('@').to_lowercase()
}

fn push_organization_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &OrganizationFilter) {
    builder.push(" WHERE 1=1");
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        builder.push(" AND LOWER(name) LIKE ");
        builder.push_bind(format!("%{}%", search.to_lowercase()));
    }
    if filter.active_only {
        builder.push(" AND is_active");
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Organizations<'c> {
    type CreateRequest = OrganizationCreateDBRequest;
    type UpdateRequest = OrganizationUpdateDBRequest;
    type Response = OrganizationDBResponse;
    type Id = OrganizationId;
    type Filter = OrganizationFilter;

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let organization = sqlx::query_as::<_, OrganizationDBResponse>(&format!(
            r#"
            INSERT INTO organizations (name, email_domain, billable_rate, notes)
            VALUES ($1, $2, $3, $4)
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(request.name.trim())
        .bind(request.email_domain.as_deref().map(normalize_domain))
        .bind(request.billable_rate)
        .bind(&request.notes)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(organization)
    }

    #[instrument(skip(self), fields(organization_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let organization =
            sqlx::query_as::<_, OrganizationDBResponse>(&format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;

        Ok(organization)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let organizations =
            sqlx::query_as::<_, OrganizationDBResponse>(&format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;

        Ok(organizations.into_iter().map(|o| (o.id, o)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations"));
        push_organization_filters(&mut builder, filter);
        builder.push(" ORDER BY name LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.skip);

        Ok(builder.build_query_as::<OrganizationDBResponse>().fetch_all(&mut *self.db).await?)
    }

    /// Organizations that still have members or tickets cannot be deleted.
    #[instrument(skip(self), fields(organization_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let (users, tickets): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users WHERE organization_id = $1),
                (SELECT COUNT(*) FROM tickets WHERE organization_id = $1)
            "#,
        )
        .bind(id)
        .fetch_one(&mut *self.db)
        .await?;

        if users > 0 || tickets > 0 {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: format!("organization still has {users} users and {tickets} tickets"),
                entity_type: "organization".to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(organization_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let organization = sqlx::query_as::<_, OrganizationDBResponse>(&format!(
            r#"
            UPDATE organizations SET
                name = COALESCE($2, name),
                email_domain = COALESCE($3, email_domain),
                billable_rate = COALESCE($4, billable_rate),
                is_active = COALESCE($5, is_active),
                notes = COALESCE($6, notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.name.as_deref().map(str::trim))
        .bind(request.email_domain.as_deref().map(normalize_domain))
        .bind(request.billable_rate)
        .bind(request.is_active)
        .bind(&request.notes)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(organization)
    }
}

impl<'c> Organizations<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &OrganizationFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM organizations");
        push_organization_filters(&mut builder, filter);
        Ok(builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?)
    }

    /// Active organization whose email domain matches, used to place new email senders.
    #[instrument(skip(self), err)]
    pub async fn find_by_email_domain(&mut self, domain: &str) -> Result<Option<OrganizationDBResponse>> {
        let organization = sqlx::query_as::<_, OrganizationDBResponse>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE LOWER(email_domain) = $1 AND is_active"
        ))
        .bind(normalize_domain(domain))
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(organization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::models::users::Role, test_utils::create_test_user_in_org};
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    fn create_request(name: &str, domain: Option<&str>) -> OrganizationCreateDBRequest {
        OrganizationCreateDBRequest {
            name: name.to_string(),
            email_domain: domain.map(str::to_string),
            billable_rate: Some(Decimal::new(8500, 2)),
            notes: None,
        }
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain(" @Example.COM "), "example.com");
        assert_eq!(normalize_domain("acme.io"), "acme.io");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_find_by_domain(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Organizations::new(&mut conn);

        let org = repo.create(&create_request("Acme", Some("@ACME.io"))).await.unwrap();
        assert_eq!(org.email_domain.as_deref(), Some("acme.io"));
        assert_eq!(org.billable_rate, Some(Decimal::new(8500, 2)));

        let found = repo.find_by_email_domain("Acme.IO").await.unwrap().unwrap();
        assert_eq!(found.id, org.id);
        assert!(repo.find_by_email_domain("other.io").await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_name(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Organizations::new(&mut conn);

        repo.create(&create_request("Acme", None)).await.unwrap();
        let err = repo.create(&create_request("Acme", None)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_protected_when_in_use(pool: PgPool) {
        let org_id = {
            let mut conn = pool.acquire().await.unwrap();
            Organizations::new(&mut conn).create(&create_request("Busy", None)).await.unwrap().id
        };
        create_test_user_in_org(&pool, Role::User, Some(org_id)).await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Organizations::new(&mut conn);
        let err = repo.delete(org_id).await.unwrap_err();
        assert!(matches!(err, DbError::ProtectedEntity { .. }));

        let empty = repo.create(&create_request("Empty", None)).await.unwrap();
        assert!(repo.delete(empty.id).await.unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_and_update(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Organizations::new(&mut conn);

        let a = repo.create(&create_request("Alpha", None)).await.unwrap();
        repo.create(&create_request("Beta", None)).await.unwrap();

        repo.update(
            a.id,
            &OrganizationUpdateDBRequest {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let filter = OrganizationFilter {
            skip: 0,
            limit: 10,
            search: None,
            active_only: true,
        };
        let active = repo.list(&filter).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Beta");
        assert_eq!(repo.count(&OrganizationFilter { active_only: false, ..filter }).await.unwrap(), 2);
    }
}
