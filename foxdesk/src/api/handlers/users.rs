use crate::{
    AppState,
    api::models::{
        pagination::PaginatedResponse,
        users::{CurrentUser, ListUsersQuery, UserCreate, UserResponse, UserUpdate},
    },
    auth::{
        password::{self, Argon2Params},
        permissions::{RequiresPermission, has_permission, operation, resource},
    },
    db::{
        handlers::{Repository, Users, users::UserFilter},
        models::users::{UserCreateDBRequest, UserUpdateDBRequest},
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, UserId, UserIdOrCurrent},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// Trim and lowercase an email address, rejecting anything without a local part and a domain.
pub(crate) fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => Ok(email),
        _ => Err(Error::BadRequest {
            message: format!("'{email}' is not a valid email address"),
        }),
    }
}

fn resolve_user_id(id: UserIdOrCurrent, current_user: &CurrentUser) -> UserId {
    match id {
        UserIdOrCurrent::Current(_) => current_user.id,
        UserIdOrCurrent::Id(id) => id,
    }
}

fn user_not_found(id: UserId) -> Error {
    Error::NotFound {
        resource: "User".to_string(),
        id: id.to_string(),
    }
}

#[utoipa::path(
    get,
    path = "/users",
    tag = "users",
    summary = "List users",
    responses(
        (status = 200, description = "Paginated list of users", body = PaginatedResponse<UserResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
    ),
    params(ListUsersQuery),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
    _: RequiresPermission<resource::Users, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = UserFilter {
        search: query.search,
        role: query.role,
        organization_id: query.organization_id,
        ..UserFilter::new(skip, limit)
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Users::new(&mut conn);
    let users = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        users.into_iter().map(UserResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    post,
    path = "/users",
    tag = "users",
    summary = "Create user",
    request_body = UserCreate,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Email already in use"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_user(
    State(state): State<AppState>,
    _: RequiresPermission<resource::Users, operation::CreateAll>,
    Json(create): Json<UserCreate>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    let email = normalize_email(&create.email)?;

    let password_hash = match create.password {
        Some(password) => {
            let password_config = &state.config.auth.native.password;
            password::validate_password(&password, password_config)?;
            Some(password::hash_password_blocking(password, Argon2Params::from(password_config)).await?)
        }
        None => None,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email,
            display_name: create.display_name,
            role: create.role,
            organization_id: create.organization_id,
            password_hash,
            notify_by_email: create.notify_by_email,
            auth_source: "native".to_string(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

#[utoipa::path(
    get,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Get user",
    responses(
        (status = 200, description = "User details", body = UserResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "User not found"),
    ),
    params(
        ("user_id" = String, Path, description = "User ID (UUID) or 'current' for the caller"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserIdOrCurrent>,
    current_user: CurrentUser,
) -> Result<Json<UserResponse>> {
    let user_id = resolve_user_id(user_id, &current_user);

    let allowed = if user_id == current_user.id {
        has_permission(&current_user, Resource::Users, Operation::ReadOwn)
    } else {
        has_permission(&current_user, Resource::Users, Operation::ReadAll)
    };
    if !allowed {
        return Err(Error::InsufficientPermissions {
            required: Permission::Any(vec![
                Permission::Allow(Resource::Users, Operation::ReadAll),
                Permission::Granted,
            ]),
            action: Operation::ReadOwn,
            resource: format!("user {user_id}"),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn).get_by_id(user_id).await?.ok_or_else(|| user_not_found(user_id))?;

    Ok(Json(UserResponse::from(user)))
}

/// Update a user
///
/// Admins may change any field of any user. Everyone else may only change their own
/// display name and notification preference.
#[utoipa::path(
    patch,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Update user",
    request_body = UserUpdate,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "User not found"),
    ),
    params(
        ("user_id" = String, Path, description = "User ID (UUID) or 'current' for the caller"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserIdOrCurrent>,
    current_user: CurrentUser,
    Json(update): Json<UserUpdate>,
) -> Result<Json<UserResponse>> {
    let user_id = resolve_user_id(user_id, &current_user);

    let request = if has_permission(&current_user, Resource::Users, Operation::UpdateAll) {
        if user_id == current_user.id && (update.is_active == Some(false) || update.role.is_some_and(|r| !r.is_staff())) {
            return Err(Error::BadRequest {
                message: "Admins cannot deactivate or demote their own account".to_string(),
            });
        }

        let email = update.email.as_deref().map(normalize_email).transpose()?;
        let password_hash = match update.password {
            Some(password) => {
                let password_config = &state.config.auth.native.password;
                password::validate_password(&password, password_config)?;
                Some(password::hash_password_blocking(password, Argon2Params::from(password_config)).await?)
            }
            None => None,
        };

        UserUpdateDBRequest {
            email,
            display_name: update.display_name,
            role: update.role,
            organization_id: update.organization_id,
            clear_organization: update.clear_organization,
            is_active: update.is_active,
            notify_by_email: update.notify_by_email,
            password_hash,
        }
    } else {
        let touches_restricted_fields = update.email.is_some()
            || update.role.is_some()
            || update.organization_id.is_some()
            || update.clear_organization
            || update.is_active.is_some()
            || update.password.is_some();

        if user_id != current_user.id || touches_restricted_fields {
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(Resource::Users, Operation::UpdateAll),
                action: Operation::UpdateAll,
                resource: format!("user {user_id}"),
            });
        }

        UserUpdateDBRequest {
            display_name: update.display_name,
            notify_by_email: update.notify_by_email,
            ..Default::default()
        }
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn).update(user_id, &request).await.map_err(|e| match e {
        crate::db::errors::DbError::NotFound => user_not_found(user_id),
        other => other.into(),
    })?;

    Ok(Json(UserResponse::from(user)))
}

/// Delete a user
///
/// Users who requested tickets cannot be deleted; deactivate them instead.
#[utoipa::path(
    delete,
    path = "/users/{user_id}",
    tag = "users",
    summary = "Delete user",
    responses(
        (status = 204, description = "User deleted"),
        (status = 400, description = "Cannot delete yourself"),
        (status = 403, description = "Forbidden, or the user still has tickets"),
        (status = 404, description = "User not found"),
    ),
    params(
        ("user_id" = uuid::Uuid, Path, description = "User ID"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    current_user: RequiresPermission<resource::Users, operation::DeleteAll>,
) -> Result<StatusCode> {
    if user_id == current_user.user.id {
        return Err(Error::BadRequest {
            message: "You cannot delete your own account".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if Users::new(&mut conn).delete(user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(user_not_found(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{bearer_token, create_test_app, create_test_organization, create_test_ticket, create_test_user},
    };
    use serde_json::json;
    use sqlx::PgPool;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Jane.Doe@Example.COM ").unwrap(), "jane.doe@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("jane@localhost").is_err());
        assert!(normalize_email("a@b@example.com").is_err());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_users_requires_staff(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let response = server.get("/api/v1/users").authorization_bearer(bearer_token(&client)).await;
        response.assert_status_forbidden();

        let response = server
            .get("/api/v1/users?role=agent")
            .authorization_bearer(bearer_token(&agent))
            .await;
        response.assert_status_ok();
        let page: PaginatedResponse<UserResponse> = response.json();
        assert!(page.data.iter().all(|u| u.role == Role::Agent));
        assert!(page.data.iter().any(|u| u.id == agent.id));

        let page: PaginatedResponse<UserResponse> = server
            .get(&format!("/api/v1/users?search={}", &admin.email[..12]))
            .authorization_bearer(bearer_token(&admin))
            .await
            .json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, admin.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_admin_creates_user(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let organization = create_test_organization(&pool).await;
        let server = create_test_app(pool);

        let response = server
            .post("/api/v1/users")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({
                "email": "Client@Acme.test",
                "display_name": "Acme Client",
                "role": "user",
                "organization_id": organization.id,
                "password": "long enough password"
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let user: UserResponse = response.json();
        assert_eq!(user.email, "client@acme.test");
        assert_eq!(user.organization_id, Some(organization.id));

        let response = server
            .post("/api/v1/users")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"email": "client@acme.test", "role": "user"}))
            .await;
        response.assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_get_current_and_other_users(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let other = create_test_user(&pool, Role::User).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let server = create_test_app(pool);

        let me: UserResponse = server
            .get("/api/v1/users/current")
            .authorization_bearer(bearer_token(&client))
            .await
            .json();
        assert_eq!(me.id, client.id);

        let response = server
            .get(&format!("/api/v1/users/{}", other.id))
            .authorization_bearer(bearer_token(&client))
            .await;
        response.assert_status_forbidden();

        let response = server
            .get(&format!("/api/v1/users/{}", other.id))
            .authorization_bearer(bearer_token(&agent))
            .await;
        response.assert_status_ok();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_self_service_update_is_restricted(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let response = server
            .patch("/api/v1/users/current")
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"display_name": "Renamed", "notify_by_email": false}))
            .await;
        response.assert_status_ok();
        let user: UserResponse = response.json();
        assert_eq!(user.display_name.as_deref(), Some("Renamed"));
        assert!(!user.notify_by_email);

        let response = server
            .patch("/api/v1/users/current")
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"role": "admin"}))
            .await;
        response.assert_status_forbidden();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_admin_update_and_self_demotion(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let server = create_test_app(pool);

        let response = server
            .patch(&format!("/api/v1/users/{}", agent.id))
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"role": "user", "is_active": false}))
            .await;
        response.assert_status_ok();
        let user: UserResponse = response.json();
        assert_eq!(user.role, Role::User);
        assert!(!user.is_active);

        let response = server
            .patch("/api/v1/users/current")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"is_active": false}))
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_user(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);

        let response = server
            .delete(&format!("/api/v1/users/{}", agent.id))
            .authorization_bearer(bearer_token(&agent))
            .await;
        response.assert_status_forbidden();

        let response = server
            .delete(&format!("/api/v1/users/{}", ticket.requester_id))
            .authorization_bearer(bearer_token(&admin))
            .await;
        response.assert_status_forbidden();

        let response = server
            .delete(&format!("/api/v1/users/{}", agent.id))
            .authorization_bearer(bearer_token(&admin))
            .await;
        response.assert_status(StatusCode::NO_CONTENT);

        let response = server
            .get(&format!("/api/v1/users/{}", agent.id))
            .authorization_bearer(bearer_token(&admin))
            .await;
        response.assert_status_not_found();
    }
}
