//! Extracting the authenticated caller from a request.
//!
//! A session JWT is accepted from the session cookie or an `Authorization: Bearer` header. The
//! token only proves identity; the user row is reloaded on every request so role changes and
//! deactivation take effect immediately.

use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{debug, instrument, trace};

use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::session,
    config::Config,
    db::handlers::{Repository, Users},
    errors::{Error, Result},
};

/// Find the session token in the cookie header.
fn session_cookie<'a>(parts: &'a Parts, config: &Config) -> Option<Result<&'a str>> {
    let cookie_header = parts.headers.get(axum::http::header::COOKIE)?;
    let cookie_str = match cookie_header.to_str() {
        Ok(s) => s,
        Err(e) => {
            return Some(Err(Error::BadRequest {
                message: format!("Invalid cookie header: {e}"),
            }));
        }
    };
    let cookie_name = &config.auth.native.session.cookie_name;

    cookie_str
        .split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name.as_str())
        .map(|(_, value)| Ok(value))
}

/// Find a bearer token in the authorization header.
fn bearer_token(parts: &Parts) -> Option<Result<&str>> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?;
    match header.to_str() {
        Ok(value) => value.strip_prefix("Bearer ").map(|token| Ok(token.trim())),
        Err(e) => Some(Err(Error::BadRequest {
            message: format!("Invalid authorization header: {e}"),
        })),
    }
}

#[instrument(skip(parts, state))]
async fn try_session_auth(parts: &Parts, state: &AppState) -> Option<Result<CurrentUser>> {
    let token = match session_cookie(parts, &state.config).or_else(|| bearer_token(parts))? {
        Ok(token) => token,
        Err(e) => return Some(Err(e)),
    };

    let claims_user = match session::verify_session_token(token, &state.config) {
        Ok(user) => user,
        Err(e) => return Some(Err(e)),
    };

    let mut conn = match state.db.acquire().await {
        Ok(conn) => conn,
        Err(e) => return Some(Err(Error::Database(e.into()))),
    };
    match Users::new(&mut conn).get_by_id(claims_user.id).await {
        Ok(Some(user)) if user.is_active => Some(Ok(CurrentUser::from(user))),
        Ok(_) => Some(Err(Error::Unauthenticated {
            message: Some("Account is disabled or no longer exists".to_string()),
        })),
        Err(e) => Some(Err(Error::Database(e))),
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if !state.config.auth.native.enabled {
            return Err(Error::Unauthenticated { message: None });
        }

        match try_session_auth(parts, state).await {
            Some(Ok(user)) => {
                debug!("Found session authenticated user: {}", user.id);
                Ok(user)
            }
            Some(Err(e)) => {
                trace!("Session authentication failed: {:?}", e);
                Err(e)
            }
            None => {
                trace!("No authentication credentials found in request");
                Err(Error::Unauthenticated { message: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{create_test_state, create_test_user},
    };
    use axum::http::Request;
    use sqlx::PgPool;

    fn parts_with_header(name: &str, value: &str) -> Parts {
        let (parts, _) = Request::builder().header(name, value).body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_session_cookie_parsing() {
        let config = Config::default();
        let parts = parts_with_header("cookie", "theme=dark; foxdesk_session=abc.def.ghi; other=1");
        let token = session_cookie(&parts, &config).unwrap().unwrap();
        assert_eq!(token, "abc.def.ghi");

        let parts = parts_with_header("cookie", "theme=dark");
        assert!(session_cookie(&parts, &config).is_none());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let parts = parts_with_header("authorization", "Bearer token-value");
        assert_eq!(bearer_token(&parts).unwrap().unwrap(), "token-value");

        let parts = parts_with_header("authorization", "Basic dXNlcjpwYXNz");
        assert!(bearer_token(&parts).is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_extracts_active_user(pool: PgPool) {
        let state = create_test_state(pool.clone());
        let user = create_test_user(&pool, Role::Agent).await;
        let token = session::create_session_token(&CurrentUser::from(user.clone()), &state.config).unwrap();

        let mut parts = parts_with_header("authorization", &format!("Bearer {token}"));
        let current = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(current.id, user.id);
        assert_eq!(current.role, Role::Agent);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_rejects_deactivated_user(pool: PgPool) {
        let state = create_test_state(pool.clone());
        let user = create_test_user(&pool, Role::User).await;
        let token = session::create_session_token(&CurrentUser::from(user.clone()), &state.config).unwrap();

        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(user.id)
            .execute(&pool)
            .await
            .unwrap();

        let mut parts = parts_with_header("authorization", &format!("Bearer {token}"));
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_missing_credentials(pool: PgPool) {
        let state = create_test_state(pool);
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated { message: None }));
    }
}
