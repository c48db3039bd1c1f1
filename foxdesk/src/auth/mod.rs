//! Authentication and authorization.
//!
//! - [`password`]: Argon2id password hashing and reset token generation
//! - [`session`]: JWT session tokens
//! - [`current_user`]: the `CurrentUser` extractor (session cookie or bearer token)
//! - [`permissions`]: role grants and the `RequiresPermission` extractor
//!
//! Roles are `admin`, `agent` and `user` (clients). Handlers that only need a static grant take
//! `RequiresPermission<resource::X, operation::Y>`; handlers with row-level rules (a client may
//! only read their own tickets) take `CurrentUser` and check after loading the row.

pub mod current_user;
pub mod password;
pub mod permissions;
pub mod session;
