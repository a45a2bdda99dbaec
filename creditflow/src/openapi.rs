//! OpenAPI document for the HTTP API, served at `/api/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api;
use crate::api::models::{
    credits::{BalanceResponse, LedgerEntryResponse},
    jobs::{JobResponse, PackResponse, SubmitJobRequest, SubmitJobResponse, SubmitPackRequest},
    pagination::Pagination,
    payments::{
        ConfirmCheckoutRequest, CreateOrderRequest, OrderResponse, SubscriptionResponse, TransactionResponse, VerifyPaymentRequest,
        VerifyPaymentResponse,
    },
    webhooks::{PaymentWebhookAck, PaymentWebhookOutcome, WebhookAck},
};
use crate::db::models::{credits::EntryReason, payments::TransactionStatus};
use crate::jobs::types::{FailureReason, JobKind, JobState};
use crate::webhooks::ingress::{CompletionNotice, WebhookOutcome};

/// Identity header set by the upstream identity proxy.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-User-Id".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-user-id",
                    "Opaque user id asserted by the identity proxy in front of the service. \
                     The header name is configurable with `auth.user_header`.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(
        api::handlers::jobs::submit_job,
        api::handlers::jobs::list_jobs,
        api::handlers::jobs::get_job,
        api::handlers::jobs::cancel_job,
        api::handlers::jobs::retry_job,
        api::handlers::jobs::submit_pack,
        api::handlers::credits::get_balance,
        api::handlers::credits::list_entries,
        api::handlers::payments::create_order,
        api::handlers::payments::verify_payment,
        api::handlers::payments::confirm_checkout,
        api::handlers::payments::list_transactions,
        api::handlers::payments::get_subscription,
        api::handlers::webhooks::provider_webhook,
        api::handlers::webhooks::payment_webhook,
    ),
    components(
        schemas(
            SubmitJobRequest, SubmitJobResponse, SubmitPackRequest, PackResponse, JobResponse, JobKind, JobState, FailureReason,
            BalanceResponse, LedgerEntryResponse, EntryReason, Pagination,
            CreateOrderRequest, OrderResponse, VerifyPaymentRequest, ConfirmCheckoutRequest, VerifyPaymentResponse,
            TransactionResponse, TransactionStatus, SubscriptionResponse,
            CompletionNotice, WebhookAck, WebhookOutcome, PaymentWebhookAck, PaymentWebhookOutcome,
        )
    ),
    tags(
        (name = "jobs", description = "Credit-metered job submission and tracking"),
        (name = "credits", description = "Credit balance and ledger"),
        (name = "payments", description = "Plan purchases"),
        (name = "webhooks", description = "Signed callbacks from the job provider and the payment gateway"),
    ),
    info(
        title = "creditflow API",
        description = "Prepaid credits, external job orchestration and payment reconciliation",
    )
)]
pub struct ApiDoc;
