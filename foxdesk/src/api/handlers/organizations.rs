use crate::{
    AppState,
    api::models::{
        organizations::{ListOrganizationsQuery, OrganizationCreate, OrganizationResponse, OrganizationUpdate},
        pagination::{PaginatedResponse, Pagination},
        users::{CurrentUser, UserResponse},
    },
    auth::permissions::{RequiresPermission, has_permission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Organizations, Repository, Users, organizations::OrganizationFilter, users::UserFilter},
        models::organizations::{OrganizationCreateDBRequest, OrganizationUpdateDBRequest},
    },
    errors::{Error, Result},
    types::{Operation, OrganizationId, Permission, Resource},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

fn organization_not_found(id: OrganizationId) -> Error {
    Error::NotFound {
        resource: "Organization".to_string(),
        id: id.to_string(),
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::BadRequest {
            message: "Organization name must not be empty".to_string(),
        });
    }
    Ok(name.to_string())
}

#[utoipa::path(
    get,
    path = "/organizations",
    tag = "organizations",
    summary = "List organizations",
    responses(
        (status = 200, description = "Paginated list of organizations", body = PaginatedResponse<OrganizationResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
    ),
    params(ListOrganizationsQuery),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_organizations(
    State(state): State<AppState>,
    Query(query): Query<ListOrganizationsQuery>,
    _: RequiresPermission<resource::Organizations, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<OrganizationResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = OrganizationFilter {
        skip,
        limit,
        search: query.search,
        active_only: query.active_only.unwrap_or(false),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Organizations::new(&mut conn);
    let organizations = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        organizations.into_iter().map(OrganizationResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    post,
    path = "/organizations",
    tag = "organizations",
    summary = "Create organization",
    request_body = OrganizationCreate,
    responses(
        (status = 201, description = "Organization created", body = OrganizationResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Name already in use"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_organization(
    State(state): State<AppState>,
    _: RequiresPermission<resource::Organizations, operation::CreateAll>,
    Json(create): Json<OrganizationCreate>,
) -> Result<(StatusCode, Json<OrganizationResponse>)> {
    let request = OrganizationCreateDBRequest {
        name: validate_name(&create.name)?,
        email_domain: create.email_domain.filter(|d| !d.trim().is_empty()),
        billable_rate: create.billable_rate,
        notes: create.notes,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let organization = Organizations::new(&mut conn).create(&request).await?;

    Ok((StatusCode::CREATED, Json(OrganizationResponse::from(organization))))
}

/// Get an organization
///
/// Clients may read the organization they belong to.
#[utoipa::path(
    get,
    path = "/organizations/{organization_id}",
    tag = "organizations",
    summary = "Get organization",
    responses(
        (status = 200, description = "Organization details", body = OrganizationResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Organization not found"),
    ),
    params(("organization_id" = uuid::Uuid, Path, description = "Organization ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_organization(
    State(state): State<AppState>,
    Path(organization_id): Path<OrganizationId>,
    current_user: CurrentUser,
) -> Result<Json<OrganizationResponse>> {
    let can_read = has_permission(&current_user, Resource::Organizations, Operation::ReadAll)
        || (current_user.organization_id == Some(organization_id)
            && has_permission(&current_user, Resource::Organizations, Operation::ReadOwn));
    if !can_read {
        return Err(Error::InsufficientPermissions {
            required: Permission::Any(vec![
                Permission::Allow(Resource::Organizations, Operation::ReadAll),
                Permission::Granted,
            ]),
            action: Operation::ReadOwn,
            resource: format!("organization {organization_id}"),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let organization = Organizations::new(&mut conn)
        .get_by_id(organization_id)
        .await?
        .ok_or_else(|| organization_not_found(organization_id))?;

    Ok(Json(OrganizationResponse::from(organization)))
}

#[utoipa::path(
    patch,
    path = "/organizations/{organization_id}",
    tag = "organizations",
    summary = "Update organization",
    request_body = OrganizationUpdate,
    responses(
        (status = 200, description = "Organization updated", body = OrganizationResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Organization not found"),
    ),
    params(("organization_id" = uuid::Uuid, Path, description = "Organization ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_organization(
    State(state): State<AppState>,
    Path(organization_id): Path<OrganizationId>,
    _: RequiresPermission<resource::Organizations, operation::UpdateAll>,
    Json(update): Json<OrganizationUpdate>,
) -> Result<Json<OrganizationResponse>> {
    let request = OrganizationUpdateDBRequest {
        name: update.name.as_deref().map(validate_name).transpose()?,
        email_domain: update.email_domain,
        billable_rate: update.billable_rate,
        is_active: update.is_active,
        notes: update.notes,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let organization = Organizations::new(&mut conn)
        .update(organization_id, &request)
        .await
        .map_err(|e| match e {
            DbError::NotFound => organization_not_found(organization_id),
            other => other.into(),
        })?;

    Ok(Json(OrganizationResponse::from(organization)))
}

/// Delete an organization
///
/// Refused while users or tickets still reference the organization.
#[utoipa::path(
    delete,
    path = "/organizations/{organization_id}",
    tag = "organizations",
    summary = "Delete organization",
    responses(
        (status = 204, description = "Organization deleted"),
        (status = 403, description = "Forbidden, or the organization is still in use"),
        (status = 404, description = "Organization not found"),
    ),
    params(("organization_id" = uuid::Uuid, Path, description = "Organization ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_organization(
    State(state): State<AppState>,
    Path(organization_id): Path<OrganizationId>,
    _: RequiresPermission<resource::Organizations, operation::DeleteAll>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Organizations::new(&mut conn).delete(organization_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(organization_not_found(organization_id))
    }
}

#[utoipa::path(
    get,
    path = "/organizations/{organization_id}/users",
    tag = "organizations",
    summary = "List organization members",
    responses(
        (status = 200, description = "Users in the organization", body = PaginatedResponse<UserResponse>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Organization not found"),
    ),
    params(
        ("organization_id" = uuid::Uuid, Path, description = "Organization ID"),
        Pagination,
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_organization_users(
    State(state): State<AppState>,
    Path(organization_id): Path<OrganizationId>,
    Query(pagination): Query<Pagination>,
    _: RequiresPermission<resource::Users, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    if Organizations::new(&mut tx).get_by_id(organization_id).await?.is_none() {
        return Err(organization_not_found(organization_id));
    }

    let (skip, limit) = pagination.params();
    let filter = UserFilter {
        organization_id: Some(organization_id),
        ..UserFilter::new(skip, limit)
    };
    let mut users_repo = Users::new(&mut tx);
    let users = users_repo.list(&filter).await?;
    let total_count = users_repo.count(&filter).await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(PaginatedResponse::new(
        users.into_iter().map(UserResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}
