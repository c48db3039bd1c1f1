//! Database models for users.

use crate::api::models::users::Role;
use crate::types::{OrganizationId, UserId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Database request for creating a new user
#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub organization_id: Option<OrganizationId>,
    pub password_hash: Option<String>,
    pub notify_by_email: bool,
    /// "native", "email" (auto-created by ingestion) or "system"
    pub auth_source: String,
}

/// Database request for updating a user. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdateDBRequest {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<Role>,
    pub organization_id: Option<OrganizationId>,
    pub clear_organization: bool,
    pub is_active: Option<bool>,
    pub notify_by_email: Option<bool>,
    pub password_hash: Option<String>,
}

/// Database response for a user
#[derive(Debug, Clone, FromRow)]
pub struct UserDBResponse {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub organization_id: Option<OrganizationId>,
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub notify_by_email: bool,
    pub auth_source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserDBResponse {
    /// Name used in greetings and comment bylines.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}
