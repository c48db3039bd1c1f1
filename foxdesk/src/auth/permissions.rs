//! Role-based permission checks.
//!
//! Every role has a fixed set of `(Resource, Operation)` grants. Handlers declare the grant they
//! need with the [`RequiresPermission`] extractor; "own" checks that depend on the row (is this
//! the caller's ticket?) happen in the handler after loading it.

use std::marker::PhantomData;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    AppState,
    api::models::users::{CurrentUser, Role},
    errors::Error,
    types::{Operation, Permission, Resource},
};

/// Whether a role holds a permission.
pub fn role_has_permission(role: Role, resource: Resource, operation: Operation) -> bool {
    use Operation::*;
    use Resource::*;

    match role {
        Role::Admin => true,
        Role::Agent => match resource {
            Tickets => !matches!(operation, DeleteAll | DeleteOwn | SystemAccess),
            Comments | InternalComments => matches!(operation, CreateAll | CreateOwn | ReadAll | ReadOwn),
            Attachments => matches!(operation, CreateAll | CreateOwn | ReadAll | ReadOwn),
            TimeEntries => matches!(operation, CreateOwn | ReadAll | ReadOwn | UpdateOwn | DeleteOwn),
            Users => matches!(operation, ReadAll | ReadOwn | UpdateOwn),
            Organizations | Lookups | RecurringTasks | Settings => matches!(operation, ReadAll | ReadOwn),
            Reports => matches!(operation, ReadAll | ReadOwn | CreateOwn | UpdateOwn | DeleteOwn),
            Ingest => matches!(operation, ReadAll),
        },
        Role::User => match resource {
            Tickets => matches!(operation, CreateOwn | ReadOwn | UpdateOwn),
            Comments => matches!(operation, CreateOwn | ReadOwn),
            Attachments => matches!(operation, CreateOwn | ReadOwn),
            Users => matches!(operation, ReadOwn | UpdateOwn),
            Organizations => operation == ReadOwn,
            Lookups | Settings => matches!(operation, ReadAll | ReadOwn),
            InternalComments | TimeEntries | RecurringTasks | Reports | Ingest => false,
        },
    }
}

/// Whether the caller holds a permission.
pub fn has_permission(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    role_has_permission(user.role, resource, operation)
}

/// Fail with `InsufficientPermissions` unless the caller holds the permission.
pub fn require(user: &CurrentUser, resource: Resource, operation: Operation) -> Result<(), Error> {
    if has_permission(user, resource, operation) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: Permission::Allow(resource, operation),
            action: operation,
            resource: resource.to_string(),
        })
    }
}

/// Marker types naming resources at the type level.
pub mod resource {
    use crate::types::Resource;

    pub trait ResourceMarker {
        const RESOURCE: Resource;
    }

    macro_rules! resources {
        ($($name:ident),* $(,)?) => {
            $(
                pub struct $name;
                impl ResourceMarker for $name {
                    const RESOURCE: Resource = Resource::$name;
                }
            )*
        };
    }

    resources!(
        Users,
        Organizations,
        Tickets,
        Comments,
        InternalComments,
        Attachments,
        TimeEntries,
        Lookups,
        RecurringTasks,
        Reports,
        Settings,
        Ingest,
    );
}

/// Marker types naming operations at the type level.
pub mod operation {
    use crate::types::Operation;

    pub trait OperationMarker {
        const OPERATION: Operation;
    }

    macro_rules! operations {
        ($($name:ident),* $(,)?) => {
            $(
                pub struct $name;
                impl OperationMarker for $name {
                    const OPERATION: Operation = Operation::$name;
                }
            )*
        };
    }

    operations!(CreateAll, CreateOwn, ReadAll, ReadOwn, UpdateAll, UpdateOwn, DeleteAll, DeleteOwn, SystemAccess);
}

/// Extractor that authenticates the caller and checks a static permission.
pub struct RequiresPermission<R, O> {
    pub user: CurrentUser,
    _marker: PhantomData<fn() -> (R, O)>,
}

impl<R, O> FromRequestParts<AppState> for RequiresPermission<R, O>
where
    R: resource::ResourceMarker,
    O: operation::OperationMarker,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        require(&user, R::RESOURCE, O::OPERATION)?;
        Ok(Self {
            user,
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_has_everything() {
        assert!(role_has_permission(Role::Admin, Resource::Settings, Operation::UpdateAll));
        assert!(role_has_permission(Role::Admin, Resource::Tickets, Operation::DeleteAll));
        assert!(role_has_permission(Role::Admin, Resource::Ingest, Operation::CreateAll));
    }

    #[test]
    fn test_agent_permissions() {
        assert!(role_has_permission(Role::Agent, Resource::Tickets, Operation::UpdateAll));
        assert!(role_has_permission(Role::Agent, Resource::InternalComments, Operation::CreateAll));
        assert!(role_has_permission(Role::Agent, Resource::Ingest, Operation::ReadAll));
        assert!(!role_has_permission(Role::Agent, Resource::Tickets, Operation::DeleteAll));
        assert!(!role_has_permission(Role::Agent, Resource::Lookups, Operation::UpdateAll));
        assert!(!role_has_permission(Role::Agent, Resource::Ingest, Operation::CreateAll));
        assert!(!role_has_permission(Role::Agent, Resource::Settings, Operation::UpdateAll));
    }

    #[test]
    fn test_client_permissions() {
        assert!(role_has_permission(Role::User, Resource::Tickets, Operation::CreateOwn));
        assert!(role_has_permission(Role::User, Resource::Users, Operation::UpdateOwn));
        assert!(role_has_permission(Role::User, Resource::Organizations, Operation::ReadOwn));
        assert!(!role_has_permission(Role::User, Resource::Organizations, Operation::UpdateOwn));
        assert!(!role_has_permission(Role::User, Resource::Tickets, Operation::ReadAll));
        assert!(!role_has_permission(Role::User, Resource::InternalComments, Operation::ReadOwn));
        assert!(!role_has_permission(Role::User, Resource::TimeEntries, Operation::ReadOwn));
        assert!(!role_has_permission(Role::User, Resource::Reports, Operation::ReadOwn));
    }

    #[test]
    fn test_require_error() {
        let user = CurrentUser {
            id: uuid::Uuid::new_v4(),
            email: "client@example.com".to_string(),
            display_name: None,
            role: Role::User,
            organization_id: None,
        };
        let err = require(&user, Resource::Settings, Operation::UpdateAll).unwrap_err();
        assert!(matches!(err, Error::InsufficientPermissions { .. }));
        assert!(require(&user, Resource::Settings, Operation::ReadAll).is_ok());
    }
}
