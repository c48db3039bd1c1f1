//! API models for priorities, statuses and ticket types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{db::models::lookups::LookupDBResponse, types::LookupId};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LookupCreate {
    pub name: String,
    /// Hex color, e.g. `#d9534f`
    pub color: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    /// Make this the default, clearing the previous one
    #[serde(default)]
    pub is_default: bool,
    /// Statuses only: tickets in this status count as closed
    #[serde(default)]
    pub is_closed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LookupUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub sort_order: Option<i32>,
    pub is_default: Option<bool>,
    pub is_closed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LookupResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: LookupId,
    pub name: String,
    pub color: String,
    pub sort_order: i32,
    pub is_default: bool,
    pub is_closed: bool,
    /// Tickets referencing this value; only unused values can be deleted
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<LookupDBResponse> for LookupResponse {
    fn from(db: LookupDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            color: db.color,
            sort_order: db.sort_order,
            is_default: db.is_default,
            is_closed: db.is_closed,
            usage_count: db.usage_count,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
