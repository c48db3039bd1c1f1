//! Database repository shared by the three lookup tables.
//!
//! Priorities, statuses and ticket types have the same shape, so one repository serves all of
//! them and picks its table from a [`LookupKind`]. Table and column names only ever come from
//! `LookupKind`, never from input.

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::lookups::{LookupCreateDBRequest, LookupDBResponse, LookupKind, LookupUpdateDBRequest},
    },
    types::{LookupId, Operation, abbrev_uuid},
};
use sqlx::PgConnection;
use std::collections::HashMap;
use tracing::instrument;

pub struct Lookups<'c> {
    db: &'c mut PgConnection,
    kind: LookupKind,
}

impl<'c> Lookups<'c> {
    pub fn new(db: &'c mut PgConnection, kind: LookupKind) -> Self {
        Self { db, kind }
    }

    fn select(&self) -> String {
        let table = self.kind.table();
        let column = self.kind.ticket_column();
        let is_closed = if self.kind == LookupKind::Statuses { "l.is_closed" } else { "FALSE" };
        let recurring = if self.kind.used_by_recurring_tasks() {
            format!(" + (SELECT COUNT(*) FROM recurring_tasks r WHERE r.{column} = l.id)")
        } else {
            String::new()
        };
        format!(
            "SELECT l.id, l.name, l.color, l.sort_order, l.is_default, {is_closed} AS is_closed, \
             ((SELECT COUNT(*) FROM tickets t WHERE t.{column} = l.id){recurring})::BIGINT AS usage_count, \
             l.created_at, l.updated_at FROM {table} l"
        )
    }

    /// Clear the default flag on every other row so the partial unique index holds.
    async fn clear_default(&mut self, except: Option<LookupId>) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET is_default = FALSE, updated_at = NOW() WHERE is_default AND id IS DISTINCT FROM $1",
            self.kind.table()
        ))
        .bind(except)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    async fn fetch(&mut self, id: LookupId) -> Result<Option<LookupDBResponse>> {
        let row = sqlx::query_as::<_, LookupDBResponse>(&format!("{} WHERE l.id = $1", self.select()))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    /// The row flagged as default. Ticket creation falls back to it.
    #[instrument(skip(self), fields(kind = ?self.kind), err)]
    pub async fn get_default(&mut self) -> Result<Option<LookupDBResponse>> {
        let row = sqlx::query_as::<_, LookupDBResponse>(&format!("{} WHERE l.is_default LIMIT 1", self.select()))
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    /// Default row, or the first by sort order when no default is flagged.
    #[instrument(skip(self), fields(kind = ?self.kind), err)]
    pub async fn default_id(&mut self) -> Result<LookupId> {
        let id: Option<LookupId> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} ORDER BY is_default DESC, sort_order, name LIMIT 1",
            self.kind.table()
        ))
        .fetch_optional(&mut *self.db)
        .await?;

        id.ok_or_else(|| DbError::Other(anyhow::anyhow!("no {} rows configured", self.kind.entity_name())))
    }

    /// Default status that is not closed; replies reopen tickets into it.
    #[instrument(skip(self), err)]
    pub async fn default_open_status_id(&mut self) -> Result<LookupId> {
        let id: Option<LookupId> =
            sqlx::query_scalar("SELECT id FROM statuses WHERE NOT is_closed ORDER BY is_default DESC, sort_order, name LIMIT 1")
                .fetch_optional(&mut *self.db)
                .await?;

        id.ok_or_else(|| DbError::Other(anyhow::anyhow!("no open status configured")))
    }

    /// Whether a status id marks tickets closed. Unknown ids count as open.
    #[instrument(skip(self), err)]
    pub async fn is_closed_status(&mut self, id: LookupId) -> Result<bool> {
        let closed: Option<bool> = sqlx::query_scalar("SELECT is_closed FROM statuses WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(closed.unwrap_or(false))
    }
}

/// Lookup values a new ticket gets when the caller does not choose them.
#[derive(Debug, Clone, Copy)]
pub struct TicketDefaults {
    pub status_id: LookupId,
    pub priority_id: LookupId,
    pub ticket_type_id: LookupId,
}

impl TicketDefaults {
    pub async fn load(db: &mut PgConnection) -> Result<Self> {
        Ok(Self {
            status_id: Lookups::new(&mut *db, LookupKind::Statuses).default_open_status_id().await?,
            priority_id: Lookups::new(&mut *db, LookupKind::Priorities).default_id().await?,
            ticket_type_id: Lookups::new(&mut *db, LookupKind::TicketTypes).default_id().await?,
        })
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Lookups<'c> {
    type CreateRequest = LookupCreateDBRequest;
    type UpdateRequest = LookupUpdateDBRequest;
    type Response = LookupDBResponse;
    type Id = LookupId;
    type Filter = ();

    #[instrument(skip(self, request), fields(kind = ?self.kind, name = %request.name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        if request.is_default {
            self.clear_default(None).await?;
        }

        let id: LookupId = if self.kind == LookupKind::Statuses {
            sqlx::query_scalar(
                "INSERT INTO statuses (name, color, sort_order, is_default, is_closed) \
                 VALUES ($1, COALESCE($2, '#6b7280'), $3, $4, $5) RETURNING id",
            )
            .bind(request.name.trim())
            .bind(&request.color)
            .bind(request.sort_order)
            .bind(request.is_default)
            .bind(request.is_closed)
            .fetch_one(&mut *self.db)
            .await?
        } else {
            sqlx::query_scalar(&format!(
                "INSERT INTO {} (name, color, sort_order, is_default) VALUES ($1, COALESCE($2, '#6b7280'), $3, $4) RETURNING id",
                self.kind.table()
            ))
            .bind(request.name.trim())
            .bind(&request.color)
            .bind(request.sort_order)
            .bind(request.is_default)
            .fetch_one(&mut *self.db)
            .await?
        };

        self.fetch(id).await?.ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(kind = ?self.kind, id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        self.fetch(id).await
    }

    #[instrument(skip(self, ids), fields(kind = ?self.kind, count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let rows = sqlx::query_as::<_, LookupDBResponse>(&format!("{} WHERE l.id = ANY($1)", self.select()))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows.into_iter().map(|r| (r.id, r)).collect())
    }

    #[instrument(skip(self, _filter), fields(kind = ?self.kind), err)]
    async fn list(&mut self, _filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let rows = sqlx::query_as::<_, LookupDBResponse>(&format!("{} ORDER BY l.sort_order, l.name", self.select()))
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows)
    }

    /// Rows still referenced by tickets or recurring tasks are protected.
    #[instrument(skip(self), fields(kind = ?self.kind, id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let Some(row) = self.fetch(id).await? else {
            return Ok(false);
        };

        if row.usage_count > 0 {
            return Err(DbError::ProtectedEntity {
                operation: Operation::DeleteAll,
                reason: format!("it is used by {} tickets or recurring tasks", row.usage_count),
                entity_type: self.kind.entity_name().to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.kind.table()))
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(kind = ?self.kind, id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        if request.is_default == Some(true) {
            self.clear_default(Some(id)).await?;
        }

        let closed_clause = if self.kind == LookupKind::Statuses {
            ", is_closed = COALESCE($6, is_closed)"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE {} SET
                name = COALESCE($2, name),
                color = COALESCE($3, color),
                sort_order = COALESCE($4, sort_order),
                is_default = COALESCE($5, is_default){closed_clause},
                updated_at = NOW()
            WHERE id = $1
            "#,
            self.kind.table()
        );
        let mut query = sqlx::query(&sql)
            .bind(id)
            .bind(request.name.as_deref().map(str::trim))
            .bind(&request.color)
            .bind(request.sort_order)
            .bind(request.is_default);
        if self.kind == LookupKind::Statuses {
            query = query.bind(request.is_closed);
        }

        let result = query.execute(&mut *self.db).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.fetch(id).await?.ok_or(DbError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_ticket;
    use sqlx::PgPool;

    fn create_request(name: &str, is_default: bool) -> LookupCreateDBRequest {
        LookupCreateDBRequest {
            name: name.to_string(),
            color: None,
            sort_order: 99,
            is_default,
            is_closed: false,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_seeded_defaults(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();

        let priority = Lookups::new(&mut conn, LookupKind::Priorities).get_default().await.unwrap().unwrap();
        assert_eq!(priority.name, "Normal");

        let statuses = Lookups::new(&mut conn, LookupKind::Statuses).list(&()).await.unwrap();
        assert_eq!(statuses.len(), 4);
        assert!(statuses.iter().any(|s| s.name == "Closed" && s.is_closed));

        let mut repo = Lookups::new(&mut conn, LookupKind::Statuses);
        let open = repo.default_open_status_id().await.unwrap();
        assert!(!repo.is_closed_status(open).await.unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_new_default_clears_old(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Lookups::new(&mut conn, LookupKind::TicketTypes);

        let created = repo.create(&create_request("Change Request", true)).await.unwrap();
        assert!(created.is_default);

        let defaults: Vec<_> = repo.list(&()).await.unwrap().into_iter().filter(|t| t.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, created.id);

        let question = repo.list(&()).await.unwrap().into_iter().find(|t| t.name == "Question").unwrap();
        repo.update(
            question.id,
            &LookupUpdateDBRequest {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(repo.default_id().await.unwrap(), question.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_status_update_is_closed(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Lookups::new(&mut conn, LookupKind::Statuses);

        let resolved = repo.create(&create_request("Resolved", false)).await.unwrap();
        assert!(!resolved.is_closed);

        let updated = repo
            .update(
                resolved.id,
                &LookupUpdateDBRequest {
                    is_closed: Some(true),
                    color: Some("#000000".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.is_closed);
        assert_eq!(updated.color, "#000000");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_refused_when_in_use(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Lookups::new(&mut conn, LookupKind::Priorities);

        let in_use = repo.get_by_id(ticket.priority_id).await.unwrap().unwrap();
        assert_eq!(in_use.usage_count, 1);
        let err = repo.delete(ticket.priority_id).await.unwrap_err();
        assert!(matches!(err, DbError::ProtectedEntity { .. }));

        let unused = repo.create(&create_request("Someday", false)).await.unwrap();
        assert_eq!(unused.usage_count, 0);
        assert!(repo.delete(unused.id).await.unwrap());
        assert!(!repo.delete(unused.id).await.unwrap());
    }
}
