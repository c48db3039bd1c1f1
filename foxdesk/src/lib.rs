//! # FoxDesk: a self-hostable helpdesk backend
//!
//! FoxDesk keeps support tickets for a team of agents and their clients. Tickets arrive through
//! the JSON API, from recurring task schedules, or by email: an ingest run polls an IMAP mailbox,
//! turns new mail into tickets and threads replies onto existing ones as comments.
//!
//! ## Architecture
//!
//! - **HTTP API** ([`api`]): Axum handlers under `/api/v1` plus session endpoints under
//!   `/authentication`, documented with OpenAPI at `/api/docs`
//! - **Persistence** ([`db`]): PostgreSQL through sqlx, one repository per table
//! - **Inbound mail** ([`ingest`]): IMAP polling, MIME parsing, dedupe, classification
//! - **Outbound mail** ([`notifications`]): ticket notifications over SMTP via lettre
//! - **Background services**: the ingest and recurring task schedulers run on the elected leader
//!   only ([`leader_election`])
//!
//! ## Application lifecycle
//!
//! 1. [`Application::new`] connects to the database, runs migrations, ensures the initial admin
//!    exists and starts background services
//! 2. [`Application::serve`] binds the HTTP listener and runs until the shutdown future resolves
//! 3. Background tasks are cancelled and awaited, then the pool and telemetry are closed
//!
//! ```no_run
//! use foxdesk::{Application, Config};
//!
//! # async fn example(config: Config) -> anyhow::Result<()> {
//! let app = Application::new(config).await?;
//! app.serve(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod errors;
pub mod ingest;
mod leader_election;
pub mod notifications;
mod openapi;
pub mod recurring;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{delete, get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;

use crate::{
    api::{handlers, models::users::Role},
    auth::password::{self, Argon2Params},
    config::CorsOrigin,
    db::{
        handlers::{Repository, Users},
        models::users::{UserCreateDBRequest, UserUpdateDBRequest},
    },
    errors::Error,
    ingest::{ImapConnector, IngestPipeline},
    notifications::Notifier,
    openapi::ApiDoc,
    recurring::RecurringScheduler,
    storage::LocalFileStorage,
    types::UserId,
};

/// How often a follower retries the leader lock and the leader checks its lock connection.
const LEADER_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Shared state handed to every handler.
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub storage: LocalFileStorage,
    pub notifier: Notifier,
    /// Shared with the scheduler; manual runs from the API take the same advisory lock
    pub ingest: IngestPipeline,
}

/// Get the FoxDesk database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the initial admin user if it doesn't exist.
///
/// Idempotent: an existing account with this email gets its password replaced when one is
/// configured, and is otherwise left alone. Returns the admin's user ID.
#[instrument(skip_all, fields(email = %email))]
pub async fn create_initial_admin_user(email: &str, password: Option<&str>, config: &Config, db: &PgPool) -> Result<UserId, Error> {
    let password_hash = match password {
        Some(pwd) => Some(password::hash_password_blocking(pwd.to_string(), Argon2Params::from(&config.auth.native.password)).await?),
        None => None,
    };

    let mut tx = db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut user_repo = Users::new(&mut tx);

    let user_id = if let Some(existing_user) = user_repo.get_user_by_email(email).await? {
        if password_hash.is_some() {
            user_repo
                .update(
                    existing_user.id,
                    &UserUpdateDBRequest {
                        password_hash,
                        ..Default::default()
                    },
                )
                .await?;
        }
        existing_user.id
    } else {
        let created = user_repo
            .create(&UserCreateDBRequest {
                email: email.to_string(),
                display_name: None,
                role: Role::Admin,
                organization_id: None,
                password_hash,
                notify_by_email: true,
                auth_source: "system".to_string(),
            })
            .await?;
        info!("Created initial admin user");
        created.id
    };

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;
    Ok(user_id)
}

/// Connect, migrate and make sure an admin exists.
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool_settings = &config.database.pool;
    let seconds = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(Duration::from_secs(pool_settings.acquire_timeout_secs))
        .idle_timeout(seconds(pool_settings.idle_timeout_secs))
        .max_lifetime(seconds(pool_settings.max_lifetime_secs))
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;

    create_initial_admin_user(&config.admin_email, config.admin_password.as_deref(), config, &pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create initial admin user: {}", e))?;

    Ok(pool)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.auth.security.cors;

    let mut origins = Vec::new();
    for origin in &cors_config.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut exposed = vec![http::header::LOCATION, http::header::CONTENT_DISPOSITION];
    for name in &cors_config.exposed_headers {
        let header = name.parse::<http::HeaderName>()?;
        if !exposed.contains(&header) {
            exposed.push(header);
        }
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(cors_config.allow_credentials)
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::PATCH,
            http::Method::DELETE,
        ])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .expose_headers(exposed);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router: session endpoints, the `/api/v1` surface, OpenAPI docs,
/// optional Prometheus metrics, CORS and request tracing.
///
/// # Errors
///
/// Returns an error if the CORS configuration does not produce valid header values.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let auth_routes = Router::new()
        .route(
            "/authentication/register",
            get(handlers::auth::get_registration_info).post(handlers::auth::register),
        )
        .route("/authentication/login", post(handlers::auth::login))
        .route("/authentication/logout", post(handlers::auth::logout))
        .route("/authentication/password-resets", post(handlers::auth::request_password_reset))
        .route("/authentication/password-resets/confirm", post(handlers::auth::confirm_password_reset))
        .route("/authentication/password-change", post(handlers::auth::change_password))
        .route("/authentication/me", get(handlers::auth::get_current_user))
        .with_state(state.clone());

    // Several files fit in one upload request; each is checked against the per-file limit
    let upload_limit = usize::try_from(state.config.attachments.max_size_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(handlers::attachments::MAX_FILES_PER_UPLOAD)
        .saturating_add(64 * 1024);

    let api_routes = Router::new()
        // Users
        .route("/users", get(handlers::users::list_users).post(handlers::users::create_user))
        .route(
            "/users/{id}",
            get(handlers::users::get_user)
                .patch(handlers::users::update_user)
                .delete(handlers::users::delete_user),
        )
        // Organizations
        .route(
            "/organizations",
            get(handlers::organizations::list_organizations).post(handlers::organizations::create_organization),
        )
        .route(
            "/organizations/{id}",
            get(handlers::organizations::get_organization)
                .patch(handlers::organizations::update_organization)
                .delete(handlers::organizations::delete_organization),
        )
        .route("/organizations/{id}/users", get(handlers::organizations::list_organization_users))
        // Priorities, statuses and ticket types
        .route(
            "/lookups/{kind}",
            get(handlers::lookups::list_lookups).post(handlers::lookups::create_lookup),
        )
        .route(
            "/lookups/{kind}/{id}",
            get(handlers::lookups::get_lookup)
                .patch(handlers::lookups::update_lookup)
                .delete(handlers::lookups::delete_lookup),
        )
        // Tickets and their sub-resources
        .route("/tickets", get(handlers::tickets::list_tickets).post(handlers::tickets::create_ticket))
        .route(
            "/tickets/{id}",
            get(handlers::tickets::get_ticket)
                .patch(handlers::tickets::update_ticket)
                .delete(handlers::tickets::delete_ticket),
        )
        .route("/tickets/{id}/assign", post(handlers::tickets::assign_ticket))
        .route(
            "/tickets/{id}/comments",
            get(handlers::comments::list_comments).post(handlers::comments::create_comment),
        )
        .route(
            "/tickets/{id}/attachments",
            get(handlers::attachments::list_attachments)
                .post(handlers::attachments::upload_attachments)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/attachments/{id}", delete(handlers::attachments::delete_attachment))
        .route("/attachments/{id}/content", get(handlers::attachments::download_attachment))
        // Time tracking
        .route("/tickets/{id}/timer", post(handlers::time_entries::start_timer))
        .route(
            "/tickets/{id}/time-entries",
            get(handlers::time_entries::list_time_entries).post(handlers::time_entries::create_time_entry),
        )
        .route("/time-entries/timer", get(handlers::time_entries::get_running_timer))
        .route("/time-entries/timer/stop", post(handlers::time_entries::stop_timer))
        .route("/time-entries/{id}", delete(handlers::time_entries::delete_time_entry))
        // Reports
        .route("/reports/time", get(handlers::reports::time_report))
        .route("/reports/tickets", get(handlers::reports::ticket_report))
        .route(
            "/reports/templates",
            get(handlers::reports::list_report_templates).post(handlers::reports::create_report_template),
        )
        .route(
            "/reports/templates/{id}",
            get(handlers::reports::get_report_template)
                .patch(handlers::reports::update_report_template)
                .delete(handlers::reports::delete_report_template),
        )
        .route("/reports/templates/{id}/run", post(handlers::reports::run_report_template))
        // Recurring tasks
        .route(
            "/recurring-tasks",
            get(handlers::recurring_tasks::list_recurring_tasks).post(handlers::recurring_tasks::create_recurring_task),
        )
        .route(
            "/recurring-tasks/{id}",
            get(handlers::recurring_tasks::get_recurring_task)
                .patch(handlers::recurring_tasks::update_recurring_task)
                .delete(handlers::recurring_tasks::delete_recurring_task),
        )
        // Settings
        .route(
            "/settings",
            get(handlers::settings::get_settings).put(handlers::settings::update_settings),
        )
        // Email ingestion
        .route(
            "/ingest/runs",
            get(handlers::ingest::list_ingest_runs).post(handlers::ingest::trigger_ingest_run),
        )
        .route("/ingest/runs/{id}", get(handlers::ingest::get_ingest_run))
        .route("/ingest/logs", get(handlers::ingest::list_ingest_logs))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(auth_routes)
        .nest("/api/v1", api_routes)
        .merge(Scalar::with_url("/api/docs", ApiDoc::openapi()));

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(move || async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// The schedulers that only the leader runs.
#[derive(Clone)]
struct LeaderServices {
    config: Config,
    ingest: IngestPipeline,
    recurring: RecurringScheduler,
}

impl LeaderServices {
    /// Spawn the enabled schedulers; they stop when `token` is cancelled.
    fn start(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.ingest.enabled {
            let pipeline = self.ingest.clone();
            let poll_interval = self.config.ingest.poll_interval;
            handles.push(tokio::spawn(ingest::scheduler::run_ingest_scheduler(
                pipeline,
                poll_interval,
                token.clone(),
            )));
        } else {
            info!("Email ingestion disabled by configuration");
        }

        if self.config.recurring.enabled {
            let scheduler = self.recurring.clone();
            let poll_interval = self.config.recurring.poll_interval;
            handles.push(tokio::spawn(scheduler.run(poll_interval, token.clone())));
        } else {
            info!("Recurring task scheduler disabled by configuration");
        }

        handles
    }
}

/// Background tasks running alongside the HTTP server.
///
/// Dropping this struct cancels the shutdown token through `drop_guard`; call
/// [`shutdown`](BackgroundServices::shutdown) to also wait for the tasks to finish.
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Start the schedulers, directly or behind leader election.
fn setup_background_services(
    pool: PgPool,
    config: Config,
    ingest: IngestPipeline,
    notifier: Notifier,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    let services = LeaderServices {
        recurring: RecurringScheduler::new(pool.clone(), notifier),
        ingest,
        config: config.clone(),
    };

    if !config.background_services.leader_election.enabled {
        info!("Launching without leader election: running as leader");
        background_tasks.extend(services.start(&shutdown_token));
    } else {
        info!("Starting leader election - will attempt to acquire leadership");
        let is_leader = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Child token for the current leadership term, replaced on every gain
        let leadership: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let leadership_gain = leadership.clone();
        let leadership_lose = leadership;
        let parent_token = shutdown_token.clone();

        let handle = tokio::spawn(leader_election::leader_election_task(
            pool,
            leader_election::LEADER_LOCK_ID,
            LEADER_CHECK_INTERVAL,
            is_leader,
            shutdown_token.clone(),
            move || {
                let services = services.clone();
                let leadership = leadership_gain.clone();
                let term_token = parent_token.child_token();
                async move {
                    *leadership.lock().await = Some(term_token.clone());
                    let started = services.start(&term_token).len();
                    info!(services = started, "Leader services started");
                    Ok::<(), anyhow::Error>(())
                }
            },
            move || {
                let leadership = leadership_lose.clone();
                async move {
                    if let Some(token) = leadership.lock().await.take() {
                        token.cancel();
                        info!("Leader services stopped (lost leadership)");
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        ));
        background_tasks.push(handle);
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Top-level container owning the router, the database pool and the background services.
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting FoxDesk with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;

        let storage = LocalFileStorage::new(&config.attachments);
        let notifier = Notifier::new(pool.clone(), &config);
        let ingest = IngestPipeline::new(
            pool.clone(),
            &config,
            storage.clone(),
            notifier.clone(),
            Arc::new(ImapConnector::new(config.ingest.imap.clone())),
        );

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(pool.clone(), config.clone(), ingest.clone(), notifier.clone(), shutdown_token);

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config.clone())
            .storage(storage)
            .notifier(notifier)
            .ingest(ingest)
            .build();
        let router = build_router(app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("FoxDesk listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{auth::password::verify_password, test_utils::*};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_initial_admin_user_is_idempotent(pool: PgPool) {
        let config = create_test_config();

        let first = create_initial_admin_user("root@example.com", Some("first-password"), &config, &pool)
            .await
            .unwrap();
        let second = create_initial_admin_user("root@example.com", Some("second-password"), &config, &pool)
            .await
            .unwrap();
        assert_eq!(first, second);

        let mut conn = pool.acquire().await.unwrap();
        let admin = Users::new(&mut conn).get_by_id(first).await.unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert_eq!(admin.auth_source, "system");
        let hash = admin.password_hash.unwrap();
        assert!(verify_password("second-password", &hash).unwrap());
        assert!(!verify_password("first-password", &hash).unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_initial_admin_user_without_password_keeps_existing(pool: PgPool) {
        let config = create_test_config();
        let id = create_initial_admin_user("root@example.com", Some("kept-password"), &config, &pool)
            .await
            .unwrap();
        create_initial_admin_user("root@example.com", None, &config, &pool).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let admin = Users::new(&mut conn).get_by_id(id).await.unwrap().unwrap();
        assert!(verify_password("kept-password", &admin.password_hash.unwrap()).unwrap());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_healthz_and_docs(pool: PgPool) {
        let server = create_test_app(pool);

        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");

        let response = server.get("/api/openapi.json").await;
        response.assert_status_ok();
        let spec: serde_json::Value = response.json();
        assert!(spec["paths"]["/api/v1/tickets"].is_object());
        assert!(spec["components"]["securitySchemes"]["BearerAuth"].is_object());
    }

    #[test]
    fn test_cors_layer_from_config() {
        let mut config = create_test_config();
        assert!(create_cors_layer(&config).is_ok());

        config.auth.security.cors.exposed_headers = vec!["not a header".to_string()];
        assert!(create_cors_layer(&config).is_err());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_background_services_shutdown_without_leader_election(pool: PgPool) {
        let mut config = create_test_config();
        config.ingest.enabled = false;
        config.recurring.poll_interval = Duration::from_millis(50);
        let state = create_test_state_with_config(pool.clone(), config.clone());

        let services = setup_background_services(pool, config, state.ingest.clone(), state.notifier.clone(), CancellationToken::new());
        assert_eq!(services.background_tasks.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), services.shutdown())
            .await
            .expect("background services should stop promptly");
    }
}
