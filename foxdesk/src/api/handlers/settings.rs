use crate::{
    AppState,
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        handlers::Settings,
        models::settings::{SystemSettings, SystemSettingsUpdate},
    },
    errors::{Error, Result},
};
use axum::{Json, extract::State};
use tracing::info;

const MAX_PREFIX_LEN: usize = 10;

fn validate_update(update: &SystemSettingsUpdate) -> Result<()> {
    if let Some(name) = &update.helpdesk_name
        && name.trim().is_empty()
    {
        return Err(Error::BadRequest {
            message: "Helpdesk name must not be empty".to_string(),
        });
    }
    if let Some(prefix) = &update.ticket_reference_prefix
        && (prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_alphanumeric()))
    {
        return Err(Error::BadRequest {
            message: format!("Ticket reference prefix must be 1-{MAX_PREFIX_LEN} letters or digits"),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/settings",
    tag = "settings",
    summary = "Get system settings",
    responses(
        (status = 200, description = "Current settings", body = SystemSettings),
        (status = 401, description = "Unauthorized"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_settings(
    State(state): State<AppState>,
    _: RequiresPermission<resource::Settings, operation::ReadAll>,
) -> Result<Json<SystemSettings>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Ok(Json(Settings::new(&mut conn).load().await?))
}

/// Update system settings
///
/// Absent fields keep their current value. A new reference prefix applies to subject tokens
/// generated from now on.
#[utoipa::path(
    put,
    path = "/settings",
    tag = "settings",
    summary = "Update system settings",
    request_body = SystemSettingsUpdate,
    responses(
        (status = 200, description = "Updated settings", body = SystemSettings),
        (status = 400, description = "Invalid value"),
        (status = 403, description = "Forbidden"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_settings(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Settings, operation::UpdateAll>,
    Json(mut update): Json<SystemSettingsUpdate>,
) -> Result<Json<SystemSettings>> {
    update.helpdesk_name = update.helpdesk_name.map(|n| n.trim().to_string());
    update.ticket_reference_prefix = update.ticket_reference_prefix.map(|p| p.trim().to_uppercase());
    validate_update(&update)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut settings = Settings::new(&mut tx).load().await?;
    settings.apply(update);
    Settings::new(&mut tx).save(&settings).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    info!(user_id = %current_user.user.id, "System settings updated");
    Ok(Json(settings))
}
