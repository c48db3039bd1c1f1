//! OpenAPI documentation.
//!
//! [`ApiDoc`] covers the session endpoints under `/authentication/*` and nests
//! [`helpdesk::HelpdeskApiDoc`] at `/api/v1`. The merged document is served at
//! `/api/openapi.json` and rendered at `/api/docs`.

pub mod helpdesk;

pub use helpdesk::ApiDoc;
