//! # creditflow: credit-metered job orchestration
//!
//! `creditflow` meters access to long-running external jobs (model training and image generation)
//! against a prepaid credit balance, and tops that balance up through a payment gateway.
//!
//! ## Overview
//!
//! Every user has a credit account backed by an append-only ledger. Submitting a job debits its
//! cost before the job reaches the provider; a job that fails for any reason is refunded exactly
//! once. Completion arrives either by webhook or by polling, and both paths race on the same
//! compare-and-set so a job reaches exactly one terminal state. Buying a plan creates a gateway
//! order which, once the payment proof or the gateway webhook verifies, credits the account
//! exactly once.
//!
//! ### Core Components
//!
//! - [`ledger`]: the idempotent credit ledger; every entry carries an idempotency key
//! - [`jobs`]: the job state machine, submission, completion tracking and the background poller
//! - [`webhooks`]: signature checks and the completion webhook ingress
//! - [`payments`] and [`payment_providers`]: order creation, payment verification and settlement
//! - [`providers`]: the job provider abstraction (Replicate, plus a local dummy)
//! - [`db`]: the [`db::Storage`] trait with in-memory and PostgreSQL implementations
//! - [`api`]: axum handlers and request/response models
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use creditflow::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = creditflow::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     creditflow::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod ledger;
mod metrics;
mod openapi;
pub mod payment_providers;
pub mod payments;
pub mod providers;
pub mod retry;
pub mod telemetry;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub mod test_utils;

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

use crate::{
    config::DatabaseConfig,
    db::{Storage, in_memory::InMemoryStorage},
    jobs::{orchestrator::JobOrchestrator, poller::CompletionPoller, tracker::JobTracker},
    ledger::CreditLedger,
    openapi::ApiDoc,
    payment_providers::PaymentProvider,
    payments::PaymentReconciler,
    providers::JobProvider,
    webhooks::ingress::WebhookIngress,
};

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .ledger(ledger)
///     .jobs(orchestrator)
///     .webhooks(ingress)
///     .payments(reconciler)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub ledger: CreditLedger,
    pub jobs: JobOrchestrator,
    pub webhooks: WebhookIngress,
    pub payments: PaymentReconciler,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Create the storage backend selected by `database`.
async fn setup_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    match &config.database {
        DatabaseConfig::InMemory => {
            info!("Using in-memory storage; all state is lost on restart");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres { url, max_connections } => {
            info!("Connecting to PostgreSQL and applying migrations");
            Ok(Arc::new(db::postgres::PostgresStorage::connect(url, *max_connections).await?))
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => {
            anyhow::bail!("database.type is postgres but creditflow was built without the `postgres` feature")
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn metrics_endpoint(State(state): State<AppState>) -> String {
    match state.metrics_handle {
        Some(handle) => metrics::render(handle).await,
        None => String::new(),
    }
}

/// Build the HTTP router over `state`.
pub fn build_router(state: &AppState) -> Router {
    use api::handlers::{credits, jobs, payments, webhooks};

    let api_routes = Router::new()
        // Jobs
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/retry", post(jobs::retry_job))
        .route("/packs", post(jobs::submit_pack))
        // Credits
        .route("/credits", get(credits::get_balance))
        .route("/credits/entries", get(credits::list_entries))
        // Payments
        .route("/payments/orders", post(payments::create_order))
        .route("/payments/verify", post(payments::verify_payment))
        .route("/payments/confirm", post(payments::confirm_checkout))
        .route("/payments/transactions", get(payments::list_transactions))
        .route("/payments/subscription", get(payments::get_subscription));

    let webhook_routes = Router::new()
        .route("/provider", post(webhooks::provider_webhook))
        .route("/payments", post(webhooks::payment_webhook));

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/openapi.json", get(openapi_json))
        .nest("/api/v1", api_routes)
        .nest("/webhooks", webhook_routes);

    if state.metrics_handle.is_some() {
        router = router.route("/internal/metrics", get(metrics_endpoint));
    }

    router.with_state(state.clone()).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Background tasks that run alongside the HTTP server.
///
/// Dropping this cancels the shutdown token through `drop_guard`, which stops the tasks without
/// waiting for them; [`shutdown`](BackgroundServices::shutdown) stops them and waits.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
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

/// Start the completion poller (which also runs the refund, orphan and abandoned-order sweeps).
fn setup_background_services(config: &Config, poller: CompletionPoller, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.jobs.poller_enabled {
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(poller.run(token)));
    } else {
        info!("Completion poller disabled; jobs complete by webhook only");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// The assembled service: router, shared state and background tasks.
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create the application with the storage, provider and gateway selected by `config`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting creditflow with configuration: {:#?}", config);

        let storage = setup_storage(&config).await?;
        let provider = providers::create_provider(&config.provider)?;
        let gateway = payment_providers::create_provider(&config.payment)?;
        Self::new_with(config, storage, provider, gateway)
    }

    /// Create the application over explicit collaborators.
    pub fn new_with(
        config: Config,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn JobProvider>,
        gateway: Arc<dyn PaymentProvider>,
    ) -> anyhow::Result<Self> {
        let metrics_handle = if config.enable_metrics {
            Some(metrics::install_recorder()?)
        } else {
            None
        };

        let ledger = CreditLedger::new(storage.clone(), config.retry);
        let tracker = JobTracker::new(storage.clone(), ledger.clone(), config.retry);
        let orchestrator = JobOrchestrator::new(
            storage.clone(),
            ledger.clone(),
            tracker.clone(),
            provider.clone(),
            config.jobs.clone(),
            config.credits.job_costs,
            config.retry,
        );
        let ingress = WebhookIngress::new(storage.clone(), tracker.clone(), config.provider_webhook_secret.clone());
        let reconciler = PaymentReconciler::new(
            storage.clone(),
            gateway,
            config.credits.plans.clone(),
            config.payments.clone(),
            config.retry,
        );

        let poller = CompletionPoller::new(storage, tracker, provider, config.jobs.clone(), config.retry)
            .with_payment_sweep(reconciler.clone());
        let bg_services = setup_background_services(&config, poller, CancellationToken::new());

        let app_state = AppState::builder()
            .config(config.clone())
            .ledger(ledger)
            .jobs(orchestrator)
            .webhooks(ingress)
            .payments(reconciler)
            .maybe_metrics_handle(metrics_handle)
            .build();
        let router = build_router(&app_state);

        Ok(Self {
            router,
            app_state,
            config,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Serve until `shutdown` resolves, then stop the background tasks.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "creditflow listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
