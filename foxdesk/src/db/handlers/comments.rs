//! Database repository for ticket comments.
//!
//! Comments are append-only; there is no update and deletion only happens through the ticket.

use crate::{
    db::{
        errors::Result,
        models::comments::{CommentCreateDBRequest, CommentDBResponse},
    },
    types::{CommentId, TicketId, abbrev_uuid},
};
use sqlx::PgConnection;
use tracing::instrument;

const COMMENT_COLUMNS: &str = "id, ticket_id, author_id, author_email, body, is_internal, source, message_id, created_at";

pub struct Comments<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Comments<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Insert a comment and bump the ticket's last activity.
    #[instrument(skip(self, request), fields(ticket_id = %abbrev_uuid(&request.ticket_id), internal = request.is_internal), err)]
    pub async fn create(&mut self, request: &CommentCreateDBRequest) -> Result<CommentDBResponse> {
        let comment = sqlx::query_as::<_, CommentDBResponse>(&format!(
            r#"
            INSERT INTO ticket_comments (ticket_id, author_id, author_email, body, is_internal, source, message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {COMMENT_COLUMNS}
            "#
        ))
        .bind(request.ticket_id)
        .bind(request.author_id)
        .bind(request.author_email.trim())
        .bind(&request.body)
        .bind(request.is_internal)
        .bind(request.source.as_str())
        .bind(&request.message_id)
        .fetch_one(&mut *self.db)
        .await?;

        sqlx::query("UPDATE tickets SET last_activity_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(request.ticket_id)
            .execute(&mut *self.db)
            .await?;

        Ok(comment)
    }

    #[instrument(skip(self), fields(comment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: CommentId) -> Result<Option<CommentDBResponse>> {
        let comment = sqlx::query_as::<_, CommentDBResponse>(&format!("SELECT {COMMENT_COLUMNS} FROM ticket_comments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(comment)
    }

    /// Comments on a ticket, oldest first. Internal notes are left out unless asked for.
    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&ticket_id)), err)]
    pub async fn list_for_ticket(&mut self, ticket_id: TicketId, include_internal: bool) -> Result<Vec<CommentDBResponse>> {
        let comments = sqlx::query_as::<_, CommentDBResponse>(&format!(
            r#"
            SELECT {COMMENT_COLUMNS} FROM ticket_comments
            WHERE ticket_id = $1 AND ($2 OR NOT is_internal)
            ORDER BY created_at, id
            "#
        ))
        .bind(ticket_id)
        .bind(include_internal)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::{
            handlers::{repository::Repository, tickets::Tickets},
            models::tickets::TicketSource,
        },
        test_utils::{create_test_ticket, create_test_user},
    };
    use sqlx::PgPool;

    fn comment(ticket_id: TicketId, body: &str, is_internal: bool) -> CommentCreateDBRequest {
        CommentCreateDBRequest {
            ticket_id,
            author_id: None,
            author_email: "someone@example.com".to_string(),
            body: body.to_string(),
            is_internal,
            source: TicketSource::Email,
            message_id: Some(format!("<{body}@example.com>")),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_internal_comments_hidden(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;
        let agent = create_test_user(&pool, Role::Agent).await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Comments::new(&mut conn);
        repo.create(&comment(ticket.id, "public", false)).await.unwrap();
        let note = repo
            .create(&CommentCreateDBRequest {
                author_id: Some(agent.id),
                author_email: agent.email.clone(),
                source: TicketSource::Web,
                message_id: None,
                ..comment(ticket.id, "internal", true)
            })
            .await
            .unwrap();
        assert_eq!(note.author_id, Some(agent.id));

        assert_eq!(repo.list_for_ticket(ticket.id, true).await.unwrap().len(), 2);
        let public = repo.list_for_ticket(ticket.id, false).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].body, "public");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_comment_bumps_activity_and_is_findable(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        Comments::new(&mut conn).create(&comment(ticket.id, "reply", false)).await.unwrap();

        let mut tickets = Tickets::new(&mut conn);
        let after = tickets.get_by_id(ticket.id).await.unwrap().unwrap();
        assert!(after.last_activity_at >= ticket.last_activity_at);

        let found = tickets.find_id_by_message_id(&["<reply@example.com>".to_string()]).await.unwrap();
        assert_eq!(found, Some(ticket.id));
    }
}
