use axum::{Json, extract::State};
use chrono::Utc;

use crate::{
    AppState,
    api::{
        handlers::users::normalize_email,
        models::{
            auth::{
                AuthResponse, AuthSuccessResponse, ChangePasswordRequest, LoginRequest, LoginResponse, LogoutResponse,
                PasswordResetConfirmRequest, PasswordResetRequest, PasswordResetResponse, RegisterRequest, RegisterResponse,
                RegistrationInfo,
            },
            users::{CurrentUser, Role, UserResponse},
        },
    },
    auth::{
        password::{self, Argon2Params},
        session,
    },
    config::Config,
    db::{
        handlers::{Organizations, PasswordResetTokens, Repository, Users},
        models::users::{UserCreateDBRequest, UserUpdateDBRequest},
    },
    errors::Error,
};

fn invalid_credentials() -> Error {
    Error::Unauthenticated {
        message: Some("Invalid email or password".to_string()),
    }
}

fn ensure_native_auth(config: &Config) -> Result<(), Error> {
    if config.auth.native.enabled {
        Ok(())
    } else {
        Err(Error::BadRequest {
            message: "Native authentication is disabled".to_string(),
        })
    }
}

/// Get registration information
#[utoipa::path(
    get,
    path = "/authentication/register",
    tag = "authentication",
    summary = "Registration info",
    responses(
        (status = 200, description = "Registration info", body = RegistrationInfo),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_registration_info(State(state): State<AppState>) -> Result<Json<RegistrationInfo>, Error> {
    let enabled = state.config.auth.native.enabled && state.config.auth.native.allow_registration;
    Ok(Json(RegistrationInfo {
        enabled,
        message: if enabled {
            "Registration is enabled".to_string()
        } else {
            "Registration is disabled".to_string()
        },
    }))
}

/// Register a new client account
///
/// New accounts get the `user` role and join the organization whose email domain matches
/// their address, if any.
#[utoipa::path(
    post,
    path = "/authentication/register",
    request_body = RegisterRequest,
    tag = "authentication",
    summary = "Register",
    responses(
        (status = 201, description = "User registered successfully", body = AuthResponse),
        (status = 400, description = "Invalid input or registration disabled"),
        (status = 409, description = "User already exists"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(State(state): State<AppState>, Json(request): Json<RegisterRequest>) -> Result<RegisterResponse, Error> {
    ensure_native_auth(&state.config)?;
    if !state.config.auth.native.allow_registration {
        return Err(Error::BadRequest {
            message: "User registration is disabled".to_string(),
        });
    }

    let email = normalize_email(&request.email)?;
    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.password, password_config)?;
    let password_hash = password::hash_password_blocking(request.password, Argon2Params::from(password_config)).await?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    if Users::new(&mut tx).get_user_by_email(&email).await?.is_some() {
        return Err(Error::Conflict {
            message: "An account with this email address already exists".to_string(),
        });
    }

    let organization_id = match email.rsplit_once('@') {
        Some((_, domain)) => Organizations::new(&mut tx).find_by_email_domain(domain).await?.map(|o| o.id),
        None => None,
    };

    let created_user = Users::new(&mut tx)
        .create(&UserCreateDBRequest {
            email,
            display_name: request.display_name,
            role: Role::User,
            organization_id,
            password_hash: Some(password_hash),
            notify_by_email: true,
            auth_source: "native".to_string(),
        })
        .await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    let token = session::create_session_token(&CurrentUser::from(created_user.clone()), &state.config)?;
    let cookie = create_session_cookie(&token, &state.config);

    let auth_response = AuthResponse {
        user: UserResponse::from(created_user),
        message: "Registration successful".to_string(),
    };

    Ok(RegisterResponse { auth_response, cookie })
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/authentication/login",
    request_body = LoginRequest,
    tag = "authentication",
    summary = "Login",
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials or disabled account"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Result<LoginResponse, Error> {
    ensure_native_auth(&state.config)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut conn);

    let user = user_repo.get_user_by_email(&request.email).await?.ok_or_else(invalid_credentials)?;
    let password_hash = user.password_hash.clone().ok_or_else(invalid_credentials)?;

    if !password::verify_password_blocking(request.password, password_hash).await? {
        return Err(invalid_credentials());
    }

    if !user.is_active {
        return Err(Error::Unauthenticated {
            message: Some("This account has been disabled".to_string()),
        });
    }

    user_repo.touch_last_login(user.id).await?;

    let token = session::create_session_token(&CurrentUser::from(user.clone()), &state.config)?;
    let cookie = create_session_cookie(&token, &state.config);

    let auth_response = AuthResponse {
        user: UserResponse::from(user),
        message: "Login successful".to_string(),
    };

    Ok(LoginResponse { auth_response, cookie })
}

/// Logout (clear session)
#[utoipa::path(
    post,
    path = "/authentication/logout",
    tag = "authentication",
    summary = "Logout",
    responses(
        (status = 200, description = "Logout successful", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>) -> Result<LogoutResponse, Error> {
    let cookie = format!(
        "{}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0",
        state.config.auth.native.session.cookie_name
    );

    let auth_response = AuthSuccessResponse {
        message: "Logout successful".to_string(),
    };

    Ok(LogoutResponse { auth_response, cookie })
}

/// Request a password reset email
///
/// The response is the same whether or not the address belongs to an account.
#[utoipa::path(
    post,
    path = "/authentication/password-resets",
    request_body = PasswordResetRequest,
    tag = "authentication",
    summary = "Request password reset",
    responses(
        (status = 200, description = "Password reset email sent if the account exists", body = PasswordResetResponse),
        (status = 400, description = "Invalid request"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<PasswordResetResponse>, Error> {
    ensure_native_auth(&state.config)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut tx).get_user_by_email(&request.email).await?;

    if let Some(user) = user.filter(|u| u.is_active) {
        let valid_for = state.config.auth.native.password_reset_token_duration;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(valid_for).map_err(|e| Error::Internal {
                operation: format!("convert reset token duration: {e}"),
            })?;

        let raw_token = password::generate_reset_token();
        PasswordResetTokens::new(&mut tx).create(user.id, &raw_token, expires_at).await?;
        tx.commit().await.map_err(|e| Error::Database(e.into()))?;

        let reset_link = format!("{}/reset-password?token={}", state.config.public_url.trim_end_matches('/'), raw_token);
        state.notifier.password_reset(user, reset_link, valid_for);
    }

    Ok(Json(PasswordResetResponse {
        message: "If an account with that email exists, a password reset link has been sent.".to_string(),
    }))
}

/// Confirm a password reset with the emailed token
#[utoipa::path(
    post,
    path = "/authentication/password-resets/confirm",
    request_body = PasswordResetConfirmRequest,
    tag = "authentication",
    summary = "Confirm password reset",
    responses(
        (status = 200, description = "Password reset successful", body = PasswordResetResponse),
        (status = 400, description = "Invalid or expired token"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> Result<Json<PasswordResetResponse>, Error> {
    ensure_native_auth(&state.config)?;

    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.new_password, password_config)?;
    let new_password_hash = password::hash_password_blocking(request.new_password, Argon2Params::from(password_config)).await?;

    let invalid_token = || Error::BadRequest {
        message: "Invalid or expired reset token".to_string(),
    };

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let token = PasswordResetTokens::new(&mut tx)
        .find_valid(&request.token)
        .await?
        .ok_or_else(invalid_token)?;

    // Two concurrent confirmations race on this update; only one marks the token used
    if !PasswordResetTokens::new(&mut tx).mark_used(token.id).await? {
        return Err(invalid_token());
    }

    Users::new(&mut tx)
        .update(
            token.user_id,
            &UserUpdateDBRequest {
                password_hash: Some(new_password_hash),
                ..Default::default()
            },
        )
        .await?;
    PasswordResetTokens::new(&mut tx).invalidate_for_user(token.user_id).await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(PasswordResetResponse {
        message: "Password has been reset successfully".to_string(),
    }))
}

/// Change password for the authenticated user
#[utoipa::path(
    post,
    path = "/authentication/password-change",
    request_body = ChangePasswordRequest,
    tag = "authentication",
    summary = "Change password",
    responses(
        (status = 200, description = "Password changed successfully", body = AuthSuccessResponse),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Current password is incorrect"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<AuthSuccessResponse>, Error> {
    ensure_native_auth(&state.config)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut conn);

    let user = user_repo.get_by_id(current_user.id).await?.ok_or_else(|| Error::Unauthenticated {
        message: Some("User not found".to_string()),
    })?;

    let password_hash = user.password_hash.ok_or_else(|| Error::BadRequest {
        message: "This account has no password yet; use a password reset to set one".to_string(),
    })?;

    if !password::verify_password_blocking(request.current_password, password_hash).await? {
        return Err(Error::Unauthenticated {
            message: Some("Current password is incorrect".to_string()),
        });
    }

    let password_config = &state.config.auth.native.password;
    password::validate_password(&request.new_password, password_config)?;
    let new_password_hash = password::hash_password_blocking(request.new_password, Argon2Params::from(password_config)).await?;

    user_repo
        .update(
            current_user.id,
            &UserUpdateDBRequest {
                password_hash: Some(new_password_hash),
                ..Default::default()
            },
        )
        .await?;

    Ok(Json(AuthSuccessResponse {
        message: "Password changed successfully".to_string(),
    }))
}

/// The authenticated user
#[utoipa::path(
    get,
    path = "/authentication/me",
    tag = "authentication",
    summary = "Current user",
    responses(
        (status = 200, description = "The caller's account", body = UserResponse),
        (status = 401, description = "Not authenticated"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_current_user(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<UserResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let user = Users::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .ok_or_else(|| Error::Unauthenticated { message: None })?;

    Ok(Json(UserResponse::from(user)))
}

/// Helper function to create a session cookie
fn create_session_cookie(token: &str, config: &Config) -> String {
    let session_config = &config.auth.native.session;
    let max_age = session_config.timeout.as_secs();
    let secure = if session_config.cookie_secure { "; Secure" } else { "" };

    format!(
        "{}={}; Path=/; HttpOnly{}; SameSite={}; Max-Age={}",
        session_config.cookie_name, token, secure, session_config.cookie_same_site, max_age
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::handlers::PasswordResetTokens,
        test_utils::{bearer_token, create_test_app, create_test_app_with_state, create_test_config, create_test_organization, create_test_state_with_config, create_test_user},
    };
    use axum::http::StatusCode;
    use serde_json::json;
    use sqlx::PgPool;

    async fn set_password(pool: &PgPool, user_id: crate::types::UserId, password: &str) {
        let hash = password::hash_password(password, Argon2Params::from(&create_test_config().auth.native.password)).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        Users::new(&mut conn)
            .update(
                user_id,
                &UserUpdateDBRequest {
                    password_hash: Some(hash),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_success(pool: PgPool) {
        let organization = create_test_organization(&pool).await;
        let mut config = create_test_config();
        config.auth.native.allow_registration = true;
        let server = create_test_app_with_state(create_test_state_with_config(pool, config));

        let domain = organization.email_domain.clone().unwrap();
        let response = server
            .post("/authentication/register")
            .json(&json!({"email": format!("New.Client@{domain}"), "password": "password123", "display_name": "New Client"}))
            .await;

        response.assert_status(StatusCode::CREATED);
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap().to_string();
        assert!(cookie.starts_with("foxdesk_session="));
        assert!(cookie.contains("HttpOnly"));

        let body: AuthResponse = response.json();
        assert_eq!(body.user.email, format!("new.client@{domain}"));
        assert_eq!(body.user.role, Role::User);
        assert_eq!(body.user.organization_id, Some(organization.id));
        assert_eq!(body.message, "Registration successful");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_disabled_by_default(pool: PgPool) {
        let server = create_test_app(pool);

        let info: RegistrationInfo = server.get("/authentication/register").await.json();
        assert!(!info.enabled);

        let response = server
            .post("/authentication/register")
            .json(&json!({"email": "someone@example.com", "password": "password123"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_register_validates_password_and_duplicates(pool: PgPool) {
        let existing = create_test_user(&pool, Role::User).await;
        let mut config = create_test_config();
        config.auth.native.allow_registration = true;
        let server = create_test_app_with_state(create_test_state_with_config(pool, config));

        let response = server
            .post("/authentication/register")
            .json(&json!({"email": "short@example.com", "password": "short"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .post("/authentication/register")
            .json(&json!({"email": existing.email.to_uppercase(), "password": "password123"}))
            .await;
        response.assert_status(StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_login_and_current_user(pool: PgPool) {
        let user = create_test_user(&pool, Role::Agent).await;
        set_password(&pool, user.id, "correct horse").await;
        let server = create_test_app(pool);

        let response = server
            .post("/authentication/login")
            .json(&json!({"email": user.email, "password": "wrong horse"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/authentication/login")
            .json(&json!({"email": user.email, "password": "correct horse"}))
            .await;
        response.assert_status_ok();
        let body: AuthResponse = response.json();
        assert_eq!(body.user.id, user.id);

        // The session cookie authenticates follow-up requests
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        let session = cookie.split(';').next().unwrap().to_string();
        let me: UserResponse = server.get("/authentication/me").add_header("cookie", session).await.json();
        assert_eq!(me.id, user.id);
        assert!(me.last_login.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_login_rejects_disabled_account(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        set_password(&pool, user.id, "password123").await;
        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(user.id)
            .execute(&pool)
            .await
            .unwrap();
        let server = create_test_app(pool);

        let response = server
            .post("/authentication/login")
            .json(&json!({"email": user.email, "password": "password123"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_logout_clears_cookie(pool: PgPool) {
        let server = create_test_app(pool);
        let response = server.post("/authentication/logout").await;
        response.assert_status_ok();
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_password_reset_request_does_not_enumerate(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool.clone());

        let known: PasswordResetResponse = server
            .post("/authentication/password-resets")
            .json(&json!({"email": user.email}))
            .await
            .json();
        let unknown: PasswordResetResponse = server
            .post("/authentication/password-resets")
            .json(&json!({"email": "nobody@example.com"}))
            .await
            .json();
        assert_eq!(known.message, unknown.message);

        let tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM password_reset_tokens WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tokens, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_password_reset_confirm_is_single_use(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            PasswordResetTokens::new(&mut conn)
                .create(user.id, "raw-reset-token", Utc::now() + chrono::Duration::minutes(10))
                .await
                .unwrap();
        }
        let server = create_test_app(pool);

        let response = server
            .post("/authentication/password-resets/confirm")
            .json(&json!({"token": "raw-reset-token", "new_password": "brand new password"}))
            .await;
        response.assert_status_ok();

        let response = server
            .post("/authentication/login")
            .json(&json!({"email": user.email, "password": "brand new password"}))
            .await;
        response.assert_status_ok();

        let response = server
            .post("/authentication/password-resets/confirm")
            .json(&json!({"token": "raw-reset-token", "new_password": "another password"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_change_password(pool: PgPool) {
        let user = create_test_user(&pool, Role::User).await;
        set_password(&pool, user.id, "old password").await;
        let server = create_test_app(pool);

        let response = server
            .post("/authentication/password-change")
            .authorization_bearer(bearer_token(&user))
            .json(&json!({"current_password": "not it", "new_password": "new password"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/authentication/password-change")
            .authorization_bearer(bearer_token(&user))
            .json(&json!({"current_password": "old password", "new_password": "new password"}))
            .await;
        response.assert_status_ok();

        let response = server
            .post("/authentication/login")
            .json(&json!({"email": user.email, "password": "new password"}))
            .await;
        response.assert_status_ok();
    }

    #[test]
    fn test_session_cookie_attributes() {
        let mut config = create_test_config();
        let cookie = create_session_cookie("abc", &config);
        assert_eq!(cookie, "foxdesk_session=abc; Path=/; HttpOnly; SameSite=strict; Max-Age=86400");

        config.auth.native.session.cookie_secure = true;
        assert!(create_session_cookie("abc", &config).contains("; Secure;"));
    }
}
