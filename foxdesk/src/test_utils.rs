//! Test fixtures: configuration, application state and database rows.

use std::sync::Arc;

use axum_test::TestServer;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::users::{CurrentUser, Role},
    auth::session,
    config::{Config, EmailTransportConfig},
    db::{
        handlers::{Organizations, Repository, TicketDefaults, Tickets, Users},
        models::{
            organizations::{OrganizationCreateDBRequest, OrganizationDBResponse},
            tickets::{TicketCreateDBRequest, TicketDBResponse, TicketSource},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    ingest::{InMemoryMailbox, IngestPipeline},
    notifications::Notifier,
    storage::LocalFileStorage,
    types::OrganizationId,
};

/// Config for tests. Emails and attachments go to fresh temporary directories, so tests
/// running in parallel never see each other's files.
pub fn create_test_config() -> Config {
    let run_dir = std::env::temp_dir().join(format!("foxdesk-test-{}", Uuid::new_v4().simple()));

    let mut config = Config {
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        public_url: "http://localhost:5173".to_string(),
        admin_email: "admin@test.com".to_string(),
        ..Default::default()
    };
    config.email.transport = EmailTransportConfig::File {
        path: run_dir.join("emails").to_string_lossy().to_string(),
    };
    config.email.from_email = "support@foxdesk.local".to_string();
    config.attachments.storage_dir = run_dir.join("attachments");
    config.auth.native.session.cookie_secure = false;
    // Fast hashing; the defaults make every login test take a second
    config.auth.native.password.argon2_memory_kib = 1024;
    config.auth.native.password.argon2_iterations = 1;
    config.background_services.leader_election.enabled = false;
    config.ingest.imap.host = "imap.test.invalid".to_string();
    config.enable_metrics = false;
    config
}

/// State wired to an in-memory mailbox instead of IMAP.
pub fn create_test_state_with_config(pool: PgPool, config: Config) -> AppState {
    create_test_state_with_mailbox(pool, config, InMemoryMailbox::new("INBOX"))
}

pub fn create_test_state_with_mailbox(pool: PgPool, config: Config, mailbox: InMemoryMailbox) -> AppState {
    let storage = LocalFileStorage::new(&config.attachments);
    let notifier = Notifier::new(pool.clone(), &config);
    let ingest = IngestPipeline::new(pool.clone(), &config, storage.clone(), notifier.clone(), Arc::new(mailbox));
    AppState::builder()
        .db(pool)
        .config(config)
        .storage(storage)
        .notifier(notifier)
        .ingest(ingest)
        .build()
}

pub fn create_test_state(pool: PgPool) -> AppState {
    create_test_state_with_config(pool, create_test_config())
}

/// The full router behind a test server.
pub fn create_test_app(pool: PgPool) -> TestServer {
    create_test_app_with_state(create_test_state(pool))
}

pub fn create_test_app_with_state(state: AppState) -> TestServer {
    let router = crate::build_router(state).expect("Failed to build router");
    TestServer::new(router).expect("Failed to create test server")
}

/// Session token for a user, for `authorization_bearer`.
pub fn bearer_token(user: &UserDBResponse) -> String {
    session::create_session_token(&CurrentUser::from(user.clone()), &create_test_config()).expect("Failed to create session token")
}

pub async fn create_test_user(pool: &PgPool, role: Role) -> UserDBResponse {
    create_test_user_in_org(pool, role, None).await
}

pub async fn create_test_user_in_org(pool: &PgPool, role: Role, organization_id: Option<OrganizationId>) -> UserDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let id = Uuid::new_v4().simple().to_string();
    let prefix = match role {
        Role::Admin => "admin",
        Role::Agent => "agent",
        Role::User => "client",
    };

    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            email: format!("{prefix}_{id}@example.com"),
            display_name: Some(format!("Test {prefix}")),
            role,
            organization_id,
            password_hash: None,
            notify_by_email: true,
            auth_source: "test".to_string(),
        })
        .await
        .expect("Failed to create test user")
}

/// An organization with a unique email domain.
pub async fn create_test_organization(pool: &PgPool) -> OrganizationDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let id = Uuid::new_v4().simple().to_string();

    Organizations::new(&mut conn)
        .create(&OrganizationCreateDBRequest {
            name: format!("Org {id}"),
            email_domain: Some(format!("{id}.example.org")),
            billable_rate: None,
            notes: None,
        })
        .await
        .expect("Failed to create test organization")
}

/// An open web ticket from a new client.
pub async fn create_test_ticket(pool: &PgPool) -> TicketDBResponse {
    let requester = create_test_user(pool, Role::User).await;
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    let defaults = TicketDefaults::load(&mut conn).await.expect("Failed to load ticket defaults");

    Tickets::new(&mut conn)
        .create(&TicketCreateDBRequest {
            subject: "Printer on fire".to_string(),
            description: "Smoke everywhere".to_string(),
            requester_id: requester.id,
            organization_id: None,
            assignee_id: None,
            status_id: defaults.status_id,
            priority_id: defaults.priority_id,
            ticket_type_id: defaults.ticket_type_id,
            source: TicketSource::Web,
            message_id: None,
            due_at: None,
        })
        .await
        .expect("Failed to create test ticket")
}
