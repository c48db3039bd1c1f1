//! Database models for organizations.

use crate::types::OrganizationId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(Debug, Clone)]
pub struct OrganizationCreateDBRequest {
    pub name: String,
    pub email_domain: Option<String>,
    pub billable_rate: Option<Decimal>,
    pub notes: Option<String>,
}

/// `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct OrganizationUpdateDBRequest {
    pub name: Option<String>,
    pub email_domain: Option<String>,
    pub billable_rate: Option<Decimal>,
    pub is_active: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OrganizationDBResponse {
    pub id: OrganizationId,
    pub name: String,
    pub email_domain: Option<String>,
    pub billable_rate: Option<Decimal>,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
