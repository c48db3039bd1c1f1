//! OpenAPI spec for the helpdesk API.

use utoipa::{
    Modify, OpenApi,
    openapi::{
        Components,
        security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};

use crate::{api, db};

/// Bearer tokens and the session cookie carry the same signed token.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Components::default);
        components.security_schemes.insert(
            "BearerAuth".to_string(),
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("Session token")
                    .description(Some(
                        "The `token` returned by `POST /authentication/login`, sent as:\n\n\
                        ```\nAuthorization: Bearer YOUR_TOKEN\n```",
                    ))
                    .build(),
            ),
        );
        components.security_schemes.insert(
            "CookieAuth".to_string(),
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                "foxdesk_session",
                "Session cookie set by login and registration. The cookie name is configurable.",
            ))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::users::list_users,
        api::handlers::users::create_user,
        api::handlers::users::get_user,
        api::handlers::users::update_user,
        api::handlers::users::delete_user,
        api::handlers::organizations::list_organizations,
        api::handlers::organizations::create_organization,
        api::handlers::organizations::get_organization,
        api::handlers::organizations::update_organization,
        api::handlers::organizations::delete_organization,
        api::handlers::organizations::list_organization_users,
        api::handlers::lookups::list_lookups,
        api::handlers::lookups::create_lookup,
        api::handlers::lookups::get_lookup,
        api::handlers::lookups::update_lookup,
        api::handlers::lookups::delete_lookup,
        api::handlers::tickets::list_tickets,
        api::handlers::tickets::create_ticket,
        api::handlers::tickets::get_ticket,
        api::handlers::tickets::update_ticket,
        api::handlers::tickets::assign_ticket,
        api::handlers::tickets::delete_ticket,
        api::handlers::comments::list_comments,
        api::handlers::comments::create_comment,
        api::handlers::attachments::list_attachments,
        api::handlers::attachments::upload_attachments,
        api::handlers::attachments::download_attachment,
        api::handlers::attachments::delete_attachment,
        api::handlers::time_entries::start_timer,
        api::handlers::time_entries::get_running_timer,
        api::handlers::time_entries::stop_timer,
        api::handlers::time_entries::list_time_entries,
        api::handlers::time_entries::create_time_entry,
        api::handlers::time_entries::delete_time_entry,
        api::handlers::reports::time_report,
        api::handlers::reports::ticket_report,
        api::handlers::reports::list_report_templates,
        api::handlers::reports::create_report_template,
        api::handlers::reports::get_report_template,
        api::handlers::reports::update_report_template,
        api::handlers::reports::delete_report_template,
        api::handlers::reports::run_report_template,
        api::handlers::recurring_tasks::list_recurring_tasks,
        api::handlers::recurring_tasks::create_recurring_task,
        api::handlers::recurring_tasks::get_recurring_task,
        api::handlers::recurring_tasks::update_recurring_task,
        api::handlers::recurring_tasks::delete_recurring_task,
        api::handlers::settings::get_settings,
        api::handlers::settings::update_settings,
        api::handlers::ingest::list_ingest_runs,
        api::handlers::ingest::get_ingest_run,
        api::handlers::ingest::trigger_ingest_run,
        api::handlers::ingest::list_ingest_logs,
    ),
    components(
        schemas(
            api::models::users::Role,
            api::models::users::UserCreate,
            api::models::users::UserUpdate,
            api::models::users::UserResponse,
            api::models::organizations::OrganizationCreate,
            api::models::organizations::OrganizationUpdate,
            api::models::organizations::OrganizationResponse,
            api::models::lookups::LookupCreate,
            api::models::lookups::LookupUpdate,
            api::models::lookups::LookupResponse,
            db::models::lookups::LookupKind,
            api::models::tickets::TicketCreate,
            api::models::tickets::TicketUpdate,
            api::models::tickets::TicketAssign,
            api::models::tickets::TicketResponse,
            db::models::tickets::TicketSource,
            api::models::comments::CommentCreate,
            api::models::comments::CommentResponse,
            api::models::attachments::AttachmentResponse,
            api::models::time_entries::TimerStart,
            api::models::time_entries::TimeEntryCreate,
            api::models::time_entries::TimeEntryResponse,
            db::models::reports::TimeGrouping,
            db::models::reports::TimeReport,
            db::models::reports::TimeReportRow,
            db::models::reports::TicketReport,
            db::models::reports::CountRow,
            db::models::reports::ReportKind,
            api::models::reports::ReportTemplateCreate,
            api::models::reports::ReportTemplateUpdate,
            api::models::reports::ReportTemplateResponse,
            api::models::reports::ReportRunResponse,
            db::models::recurring_tasks::Recurrence,
            api::models::recurring_tasks::RecurringTaskCreate,
            api::models::recurring_tasks::RecurringTaskUpdate,
            api::models::recurring_tasks::RecurringTaskResponse,
            db::models::settings::SystemSettings,
            db::models::settings::SystemSettingsUpdate,
            db::models::ingest::IngestOutcome,
            api::models::ingest::IngestRunResponse,
            api::models::ingest::IngestLogResponse,
        )
    ),
    tags(
        (name = "users", description = "Accounts for clients, agents and admins."),
        (name = "organizations", description = "Client companies. Registrations and email senders are matched to an organization by email domain."),
        (name = "lookups", description = "Configurable priorities, statuses and ticket types. Each kind has exactly one default."),
        (name = "tickets", description = "Support requests. Clients see their own tickets; agents and admins see all of them."),
        (name = "comments", description = "Replies and internal notes on a ticket."),
        (name = "attachments", description = "Files attached to tickets or comments."),
        (name = "time_entries", description = "Timers and logged work on tickets."),
        (name = "reports", description = "Time and ticket reports, and saved report templates."),
        (name = "recurring_tasks", description = "Schedules that open a ticket daily, weekly or monthly."),
        (name = "settings", description = "Runtime-editable helpdesk settings."),
        (name = "ingest", description = "Inbound email: mailbox polling runs and per-message outcomes."),
    ),
)]
pub struct HelpdeskApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::get_registration_info,
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::logout,
        api::handlers::auth::request_password_reset,
        api::handlers::auth::confirm_password_reset,
        api::handlers::auth::change_password,
        api::handlers::auth::get_current_user,
    ),
    components(
        schemas(
            api::models::auth::RegisterRequest,
            api::models::auth::LoginRequest,
            api::models::auth::AuthResponse,
            api::models::auth::AuthSuccessResponse,
            api::models::auth::RegistrationInfo,
            api::models::auth::PasswordResetRequest,
            api::models::auth::PasswordResetConfirmRequest,
            api::models::auth::PasswordResetResponse,
            api::models::auth::ChangePasswordRequest,
        )
    ),
    nest(
        (path = "/api/v1", api = HelpdeskApiDoc)
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "authentication", description = "Registration, login, logout and password management."),
    ),
    info(
        title = "FoxDesk API",
        version = "1.0.0",
        description = "Helpdesk ticketing: tickets, comments, attachments, time tracking, reports and email ingestion.

## Authentication

Log in with `POST /authentication/login`. The response sets a session cookie and also returns the token, which can be sent instead as:

```
Authorization: Bearer YOUR_TOKEN
```

## Errors

Failures return a JSON body with a `message` field and the HTTP status: `400` for invalid input, `401` without a valid session, `403` when the role does not allow the action, `404` for missing or hidden resources and `409` for conflicts such as a duplicate email.",
    ),
)]
pub struct ApiDoc;
