//! Database repository for tickets.

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::tickets::{TicketCreateDBRequest, TicketDBResponse, TicketUpdateDBRequest},
    },
    types::{LookupId, OrganizationId, TicketId, UserId, abbrev_uuid},
};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const TICKET_SELECT: &str = r#"
    SELECT
        t.id, t.reference, t.subject, t.description,
        t.requester_id, r.email AS requester_email,
        t.organization_id,
        t.assignee_id, a.email AS assignee_email,
        t.status_id, s.name AS status_name, s.is_closed,
        t.priority_id, p.name AS priority_name,
        t.ticket_type_id, tt.name AS ticket_type_name,
        t.source, t.message_id, t.due_at, t.closed_at, t.last_activity_at, t.created_at, t.updated_at
    FROM tickets t
    JOIN users r ON r.id = t.requester_id
    LEFT JOIN users a ON a.id = t.assignee_id
    JOIN statuses s ON s.id = t.status_id
    JOIN priorities p ON p.id = t.priority_id
    JOIN ticket_types tt ON tt.id = t.ticket_type_id
"#;

/// Restricts listing to what a client may see: their own tickets, plus their organization's
/// tickets when that is enabled.
#[derive(Debug, Clone, Copy)]
pub struct TicketScope {
    pub requester_id: UserId,
    pub organization_id: Option<OrganizationId>,
}

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub skip: i64,
    pub limit: i64,
    pub status_id: Option<LookupId>,
    pub priority_id: Option<LookupId>,
    pub ticket_type_id: Option<LookupId>,
    pub assignee_id: Option<UserId>,
    pub unassigned: bool,
    pub requester_id: Option<UserId>,
    pub organization_id: Option<OrganizationId>,
    pub open_only: bool,
    pub search: Option<String>,
    pub scope: Option<TicketScope>,
}

impl TicketFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            skip,
            limit,
            ..Default::default()
        }
    }
}

fn push_ticket_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &TicketFilter) {
    builder.push(" WHERE 1=1");
    if let Some(scope) = filter.scope {
        builder.push(" AND (t.requester_id = ");
        builder.push_bind(scope.requester_id);
        if let Some(organization_id) = scope.organization_id {
            builder.push(" OR t.organization_id = ");
            builder.push_bind(organization_id);
        }
        builder.push(")");
    }
    if let Some(status_id) = filter.status_id {
        builder.push(" AND t.status_id = ");
        builder.push_bind(status_id);
    }
    if let Some(priority_id) = filter.priority_id {
        builder.push(" AND t.priority_id = ");
        builder.push_bind(priority_id);
    }
    if let Some(ticket_type_id) = filter.ticket_type_id {
        builder.push(" AND t.ticket_type_id = ");
        builder.push_bind(ticket_type_id);
    }
    if let Some(assignee_id) = filter.assignee_id {
        builder.push(" AND t.assignee_id = ");
        builder.push_bind(assignee_id);
    }
    if filter.unassigned {
        builder.push(" AND t.assignee_id IS NULL");
    }
    if let Some(requester_id) = filter.requester_id {
        builder.push(" AND t.requester_id = ");
        builder.push_bind(requester_id);
    }
    if let Some(organization_id) = filter.organization_id {
        builder.push(" AND t.organization_id = ");
        builder.push_bind(organization_id);
    }
    if filter.open_only {
        builder.push(" AND NOT s.is_closed");
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.to_lowercase());
        builder.push(" AND (LOWER(t.subject) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(t.description) LIKE ");
        builder.push_bind(pattern);
        if let Ok(reference) = search.trim_start_matches('#').parse::<i64>() {
            builder.push(" OR t.reference = ");
            builder.push_bind(reference);
        }
        builder.push(")");
    }
}

pub struct Tickets<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Tickets<'c> {
    type CreateRequest = TicketCreateDBRequest;
    type UpdateRequest = TicketUpdateDBRequest;
    type Response = TicketDBResponse;
    type Id = TicketId;
    type Filter = TicketFilter;

    #[instrument(skip(self, request), fields(requester_id = %abbrev_uuid(&request.requester_id), source = %request.source), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let id: TicketId = sqlx::query_scalar(
            r#"
            INSERT INTO tickets (
                subject, description, requester_id, organization_id, assignee_id,
                status_id, priority_id, ticket_type_id, source, message_id, due_at, closed_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                CASE WHEN (SELECT is_closed FROM statuses WHERE id = $6) THEN NOW() END
            )
            RETURNING id
            "#,
        )
        .bind(request.subject.trim())
        .bind(&request.description)
        .bind(request.requester_id)
        .bind(request.organization_id)
        .bind(request.assignee_id)
        .bind(request.status_id)
        .bind(request.priority_id)
        .bind(request.ticket_type_id)
        .bind(request.source.as_str())
        .bind(&request.message_id)
        .bind(request.due_at)
        .fetch_one(&mut *self.db)
        .await?;

        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let ticket = sqlx::query_as::<_, TicketDBResponse>(&format!("{TICKET_SELECT} WHERE t.id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(ticket)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let tickets = sqlx::query_as::<_, TicketDBResponse>(&format!("{TICKET_SELECT} WHERE t.id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(tickets.into_iter().map(|t| (t.id, t)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut builder = QueryBuilder::<Postgres>::new(TICKET_SELECT);
        push_ticket_filters(&mut builder, filter);
        builder.push(" ORDER BY t.last_activity_at DESC, t.reference DESC LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.skip);

        Ok(builder.build_query_as::<TicketDBResponse>().fetch_all(&mut *self.db).await?)
    }

    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tickets WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moving into a closed status stamps `closed_at`; moving out of one clears it.
    #[instrument(skip(self, request), fields(ticket_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let result = sqlx::query(
            r#"
            UPDATE tickets t SET
                subject = COALESCE($2, t.subject),
                description = COALESCE($3, t.description),
                organization_id = COALESCE($4, t.organization_id),
                assignee_id = CASE WHEN $5 THEN NULL ELSE COALESCE($6, t.assignee_id) END,
                status_id = COALESCE($7, t.status_id),
                priority_id = COALESCE($8, t.priority_id),
                ticket_type_id = COALESCE($9, t.ticket_type_id),
                due_at = CASE WHEN $10 THEN NULL ELSE COALESCE($11, t.due_at) END,
                closed_at = CASE
                    WHEN (SELECT is_closed FROM statuses WHERE id = COALESCE($7, t.status_id))
                        THEN COALESCE(t.closed_at, NOW())
                    ELSE NULL
                END,
                last_activity_at = NOW(),
                updated_at = NOW()
            WHERE t.id = $1
            "#,
        )
        .bind(id)
        .bind(request.subject.as_deref().map(str::trim))
        .bind(&request.description)
        .bind(request.organization_id)
        .bind(request.clear_assignee)
        .bind(request.assignee_id)
        .bind(request.status_id)
        .bind(request.priority_id)
        .bind(request.ticket_type_id)
        .bind(request.clear_due_at)
        .bind(request.due_at)
        .execute(&mut *self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }
}

impl<'c> Tickets<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &TicketFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM tickets t JOIN statuses s ON s.id = t.status_id",
        );
        push_ticket_filters(&mut builder, filter);
        Ok(builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_reference(&mut self, reference: i64) -> Result<Option<TicketDBResponse>> {
        let ticket = sqlx::query_as::<_, TicketDBResponse>(&format!("{TICKET_SELECT} WHERE t.reference = $1"))
            .bind(reference)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(ticket)
    }

    /// Ticket that an inbound Message-ID belongs to, either as the opening message or as a comment.
    #[instrument(skip(self), err)]
    pub async fn find_id_by_message_id(&mut self, message_ids: &[String]) -> Result<Option<TicketId>> {
        if message_ids.is_empty() {
            return Ok(None);
        }
        let id: Option<TicketId> = sqlx::query_scalar(
            r#"
            SELECT ticket_id FROM (
                SELECT id AS ticket_id, created_at FROM tickets WHERE message_id = ANY($1)
                UNION ALL
                SELECT ticket_id, created_at FROM ticket_comments WHERE message_id = ANY($1)
            ) matches
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(message_ids)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(id)
    }

    /// Move a closed ticket back to an open status. Returns whether it was closed.
    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&id)), err)]
    pub async fn reopen(&mut self, id: TicketId, open_status_id: LookupId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tickets t SET status_id = $2, closed_at = NULL, last_activity_at = NOW(), updated_at = NOW()
            FROM statuses s
            WHERE t.id = $1 AND s.id = t.status_id AND s.is_closed
            "#,
        )
        .bind(id)
        .bind(open_status_id)
        .execute(&mut *self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
