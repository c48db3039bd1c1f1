//! Shared pagination types for API query parameters.
//!
//! All list endpoints use offset-based pagination with `skip` and `limit` parameters.

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

/// Default number of items to return per page.
pub const DEFAULT_LIMIT: i64 = 25;

/// Maximum number of items that can be requested per page.
pub const MAX_LIMIT: i64 = 200;

/// Standard pagination parameters.
///
/// The `limit` is clamped to `1..=MAX_LIMIT`. Values arrive as strings because these
/// parameters are usually flattened into larger query structs.
#[serde_as]
#[derive(Debug, Default, Clone, Deserialize, IntoParams, ToSchema)]
pub struct Pagination {
    /// Number of items to skip (default: 0)
    #[param(default = 0, minimum = 0)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub skip: Option<i64>,

    /// Maximum number of items to return (default: 25, max: 200)
    #[param(default = 25, minimum = 1, maximum = 200)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub limit: Option<i64>,
}

impl Pagination {
    #[inline]
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    #[inline]
    pub fn params(&self) -> (i64, i64) {
        (self.skip(), self.limit())
    }
}

/// Paginated response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    /// The items for the current page
    pub data: Vec<T>,
    /// Total number of items matching the query (before pagination)
    pub total_count: i64,
    pub skip: i64,
    pub limit: i64,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_count: i64, skip: i64, limit: i64) -> Self {
        Self {
            data,
            total_count,
            skip,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let pagination = Pagination::default();
        assert_eq!(pagination.params(), (0, DEFAULT_LIMIT));
    }

    #[test]
    fn test_clamping() {
        let pagination = Pagination {
            skip: Some(-5),
            limit: Some(10_000),
        };
        assert_eq!(pagination.skip(), 0);
        assert_eq!(pagination.limit(), MAX_LIMIT);

        let pagination = Pagination {
            skip: Some(3),
            limit: Some(0),
        };
        assert_eq!(pagination.params(), (3, 1));
    }

    #[test]
    fn test_deserialize_from_query_strings() {
        let pagination: Pagination = serde_json::from_str(r#"{"skip": "20", "limit": "5"}"#).unwrap();
        assert_eq!(pagination.params(), (20, 5));
    }
}
