//! Priorities, statuses and ticket types share one set of handlers, keyed by
//! [`LookupKind`] in the path.

use crate::{
    AppState,
    api::models::lookups::{LookupCreate, LookupResponse, LookupUpdate},
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Lookups, Repository},
        models::lookups::{LookupCreateDBRequest, LookupKind, LookupUpdateDBRequest},
    },
    errors::{Error, Result},
    types::LookupId,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

fn lookup_not_found(kind: LookupKind, id: LookupId) -> Error {
    Error::NotFound {
        resource: kind.entity_name().to_string(),
        id: id.to_string(),
    }
}

fn validate_name(kind: LookupKind, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest {
            message: format!("A {} needs a name", kind.entity_name()),
        });
    }
    Ok(name.to_string())
}

/// Accepts `#rgb` and `#rrggbb`.
fn validate_color(color: &str) -> Result<String> {
    let hex = color.trim().trim_start_matches('#');
    if matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(format!("#{}", hex.to_lowercase()))
    } else {
        Err(Error::BadRequest {
            message: format!("'{color}' is not a hex color"),
        })
    }
}

fn reject_is_closed(kind: LookupKind, is_closed: bool) -> Result<()> {
    if is_closed && kind != LookupKind::Statuses {
        return Err(Error::BadRequest {
            message: "Only statuses can be marked as closed".to_string(),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/lookups/{kind}",
    tag = "lookups",
    summary = "List lookup values",
    responses(
        (status = 200, description = "Values in sort order, with ticket usage counts", body = Vec<LookupResponse>),
        (status = 400, description = "Unknown lookup kind"),
        (status = 401, description = "Unauthorized"),
    ),
    params(("kind" = LookupKind, Path, description = "priorities, statuses or ticket_types")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub async fn list_lookups(
    State(state): State<AppState>,
    Path(kind): Path<LookupKind>,
    _: RequiresPermission<resource::Lookups, operation::ReadAll>,
) -> Result<Json<Vec<LookupResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let values = Lookups::new(&mut conn, kind).list(&()).await?;
    Ok(Json(values.into_iter().map(LookupResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/lookups/{kind}",
    tag = "lookups",
    summary = "Create lookup value",
    request_body = LookupCreate,
    responses(
        (status = 201, description = "Value created", body = LookupResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Name already in use"),
    ),
    params(("kind" = LookupKind, Path, description = "priorities, statuses or ticket_types")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub async fn create_lookup(
    State(state): State<AppState>,
    Path(kind): Path<LookupKind>,
    _: RequiresPermission<resource::Lookups, operation::CreateAll>,
    Json(create): Json<LookupCreate>,
) -> Result<(StatusCode, Json<LookupResponse>)> {
    reject_is_closed(kind, create.is_closed)?;
    let request = LookupCreateDBRequest {
        name: validate_name(kind, &create.name)?,
        color: create.color.as_deref().map(validate_color).transpose()?,
        sort_order: create.sort_order,
        is_default: create.is_default,
        is_closed: create.is_closed,
    };

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let value = Lookups::new(&mut tx, kind).create(&request).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok((StatusCode::CREATED, Json(LookupResponse::from(value))))
}

#[utoipa::path(
    get,
    path = "/lookups/{kind}/{id}",
    tag = "lookups",
    summary = "Get lookup value",
    responses(
        (status = 200, description = "Lookup value", body = LookupResponse),
        (status = 404, description = "Not found"),
    ),
    params(
        ("kind" = LookupKind, Path, description = "priorities, statuses or ticket_types"),
        ("id" = uuid::Uuid, Path, description = "Value ID"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub async fn get_lookup(
    State(state): State<AppState>,
    Path((kind, id)): Path<(LookupKind, LookupId)>,
    _: RequiresPermission<resource::Lookups, operation::ReadAll>,
) -> Result<Json<LookupResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let value = Lookups::new(&mut conn, kind)
        .get_by_id(id)
        .await?
        .ok_or_else(|| lookup_not_found(kind, id))?;
    Ok(Json(LookupResponse::from(value)))
}

/// Update a lookup value
///
/// Setting `is_default` moves the default flag from the previous default to this value.
#[utoipa::path(
    patch,
    path = "/lookups/{kind}/{id}",
    tag = "lookups",
    summary = "Update lookup value",
    request_body = LookupUpdate,
    responses(
        (status = 200, description = "Value updated", body = LookupResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Not found"),
    ),
    params(
        ("kind" = LookupKind, Path, description = "priorities, statuses or ticket_types"),
        ("id" = uuid::Uuid, Path, description = "Value ID"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub async fn update_lookup(
    State(state): State<AppState>,
    Path((kind, id)): Path<(LookupKind, LookupId)>,
    _: RequiresPermission<resource::Lookups, operation::UpdateAll>,
    Json(update): Json<LookupUpdate>,
) -> Result<Json<LookupResponse>> {
    reject_is_closed(kind, update.is_closed.unwrap_or(false))?;
    if update.is_default == Some(false) {
        return Err(Error::BadRequest {
            message: format!("Choose another default {} instead of clearing this one", kind.entity_name()),
        });
    }

    let request = LookupUpdateDBRequest {
        name: update.name.as_deref().map(|n| validate_name(kind, n)).transpose()?,
        color: update.color.as_deref().map(validate_color).transpose()?,
        sort_order: update.sort_order,
        is_default: update.is_default,
        is_closed: update.is_closed,
    };

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let value = Lookups::new(&mut tx, kind).update(id, &request).await.map_err(|e| match e {
        DbError::NotFound => lookup_not_found(kind, id),
        other => other.into(),
    })?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(LookupResponse::from(value)))
}

/// Delete a lookup value
///
/// Values still referenced by tickets cannot be deleted.
#[utoipa::path(
    delete,
    path = "/lookups/{kind}/{id}",
    tag = "lookups",
    summary = "Delete lookup value",
    responses(
        (status = 204, description = "Value deleted"),
        (status = 403, description = "Forbidden, or the value is in use"),
        (status = 404, description = "Not found"),
    ),
    params(
        ("kind" = LookupKind, Path, description = "priorities, statuses or ticket_types"),
        ("id" = uuid::Uuid, Path, description = "Value ID"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub async fn delete_lookup(
    State(state): State<AppState>,
    Path((kind, id)): Path<(LookupKind, LookupId)>,
    _: RequiresPermission<resource::Lookups, operation::DeleteAll>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Lookups::new(&mut conn, kind).delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(lookup_not_found(kind, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{bearer_token, create_test_app, create_test_ticket, create_test_user},
    };
    use serde_json::json;
    use sqlx::PgPool;

    #[test]
    fn test_validate_color() {
        assert_eq!(validate_color("#FF8800").unwrap(), "#ff8800");
        assert_eq!(validate_color("abc").unwrap(), "#abc");
        assert!(validate_color("#12345").is_err());
        assert!(validate_color("red").is_err());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_everyone_lists_seeded_statuses(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let response = server
            .get("/api/v1/lookups/statuses")
            .authorization_bearer(bearer_token(&client))
            .await;
        response.assert_status_ok();
        let statuses: Vec<LookupResponse> = response.json();
        assert!(statuses.iter().any(|s| s.name == "Open" && s.is_default && !s.is_closed));
        assert!(statuses.iter().any(|s| s.name == "Closed" && s.is_closed));

        let response = server
            .get("/api/v1/lookups/colors")
            .authorization_bearer(bearer_token(&client))
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_new_default_replaces_old_one(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let server = create_test_app(pool);

        let response = server
            .post("/api/v1/lookups/priorities")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"name": "Critical", "color": "#FF0000", "sort_order": 99, "is_default": true}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let critical: LookupResponse = response.json();
        assert_eq!(critical.color, "#ff0000");

        let priorities: Vec<LookupResponse> = server
            .get("/api/v1/lookups/priorities")
            .authorization_bearer(bearer_token(&admin))
            .await
            .json();
        let defaults: Vec<_> = priorities.iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, critical.id);

        let response = server
            .post("/api/v1/lookups/priorities")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"name": "Broken", "is_closed": true}))
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_lookup_writes_are_admin_only(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let server = create_test_app(pool);

        let response = server
            .post("/api/v1/lookups/ticket_types")
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"name": "Hardware"}))
            .await;
        response.assert_status_forbidden();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_refused_while_in_use(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);

        let response = server
            .delete(&format!("/api/v1/lookups/statuses/{}", ticket.status_id))
            .authorization_bearer(bearer_token(&admin))
            .await;
        response.assert_status_forbidden();

        let unused: LookupResponse = server
            .post("/api/v1/lookups/statuses")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"name": "On Hold"}))
            .await
            .json();
        assert_eq!(unused.usage_count, 0);

        let response = server
            .delete(&format!("/api/v1/lookups/statuses/{}", unused.id))
            .authorization_bearer(bearer_token(&admin))
            .await;
        response.assert_status(StatusCode::NO_CONTENT);
    }
}
