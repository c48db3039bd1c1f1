//! API request/response models for organizations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::{db::models::organizations::OrganizationDBResponse, types::OrganizationId};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationCreate {
    pub name: String,
    /// Email senders from this domain are placed in the organization when auto-created
    pub email_domain: Option<String>,
    /// Hourly rate used for billable amounts in time reports
    #[schema(value_type = Option<String>)]
    pub billable_rate: Option<Decimal>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OrganizationUpdate {
    pub name: Option<String>,
    pub email_domain: Option<String>,
    #[schema(value_type = Option<String>)]
    pub billable_rate: Option<Decimal>,
    pub is_active: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: OrganizationId,
    pub name: String,
    pub email_domain: Option<String>,
    #[schema(value_type = Option<String>)]
    pub billable_rate: Option<Decimal>,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrganizationDBResponse> for OrganizationResponse {
    fn from(db: OrganizationDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            email_domain: db.email_domain,
            billable_rate: db.billable_rate,
            is_active: db.is_active,
            notes: db.notes,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListOrganizationsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Case-insensitive substring match on name or email domain
    pub search: Option<String>,

    /// Only return active organizations
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub active_only: Option<bool>,
}
