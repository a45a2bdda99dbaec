//! Test helpers: an application over in-memory storage, a scripted provider and the dummy gateway.

use axum_test::TestServer;
use std::sync::Arc;

use crate::config::{Config, DummyPaymentConfig};
use crate::db::in_memory::InMemoryStorage;
use crate::payment_providers::PaymentProvider;
use crate::payment_providers::dummy::DummyPaymentProvider;
use crate::providers::mock::MockProvider;
use crate::retry::RetryPolicy;
use crate::webhooks::signing::hmac_sha256_hex;
use crate::{AppState, Application, BackgroundServices};

/// Identity header used by [`create_test_config`].
pub const TEST_USER_HEADER: &str = "x-user-id";

/// Collaborators behind a test server, for scripting and inspection.
pub struct TestContext {
    pub storage: Arc<InMemoryStorage>,
    pub provider: MockProvider,
    pub state: AppState,
    pub bg_services: BackgroundServices,
}

/// Defaults with 100 initial credits, no poller, no metrics and no retry delays.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.credits.initial_credits = 100;
    config.jobs.poller_enabled = false;
    config.enable_metrics = false;
    config.retry = RetryPolicy::none();
    config
}

pub async fn create_test_app() -> (TestServer, TestContext) {
    create_test_app_with(create_test_config()).await
}

pub async fn create_test_app_with(config: Config) -> (TestServer, TestContext) {
    create_test_app_with_gateway(config, Arc::new(DummyPaymentProvider::from(DummyPaymentConfig::default()))).await
}

pub async fn create_test_app_with_gateway(config: Config, gateway: Arc<dyn PaymentProvider>) -> (TestServer, TestContext) {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = MockProvider::new();

    let app = Application::new_with(config, storage.clone(), Arc::new(provider.clone()), gateway)
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg_services) = app.into_test_server();

    (
        server,
        TestContext {
            storage,
            provider,
            state,
            bg_services,
        },
    )
}

/// Payment proof the dummy gateway accepts for `order_id` and `payment_id`.
pub fn sign_payment(order_id: &str, payment_id: &str) -> String {
    hmac_sha256_hex(
        DummyPaymentConfig::default().secret.as_bytes(),
        format!("{order_id}|{payment_id}").as_bytes(),
    )
}
