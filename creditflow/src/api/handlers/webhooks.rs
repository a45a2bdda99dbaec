//! Inbound webhooks from the job provider and the payment gateway.
//!
//! Both endpoints authenticate by signature rather than by user. Anything that verifies is
//! acknowledged with 200, including events that change nothing, so senders stop redelivering.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use tracing::{info, instrument};

use crate::{
    AppState,
    api::models::webhooks::{PaymentWebhookAck, PaymentWebhookOutcome, WebhookAck},
    errors::Result,
    payment_providers::PaymentError,
    payments::VerifyOutcome,
    webhooks::ingress::CompletionNotice,
};

/// Receive a job completion notification
#[utoipa::path(
    post,
    path = "/webhooks/provider",
    tag = "webhooks",
    summary = "Provider completion webhook",
    description = "Signed with Standard Webhooks headers (`webhook-id`, `webhook-timestamp`, `webhook-signature`) \
                   when a provider webhook secret is configured.",
    request_body = CompletionNotice,
    responses(
        (status = 200, description = "Notification handled", body = WebhookAck),
        (status = 400, description = "Malformed notification"),
        (status = 401, description = "Signature rejected"),
    )
)]
#[instrument(skip_all)]
pub async fn provider_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<WebhookAck>> {
    let outcome = state.webhooks.receive(&headers, &body).await?;
    Ok(Json(WebhookAck { outcome }))
}

/// Receive a payment gateway event
#[utoipa::path(
    post,
    path = "/webhooks/payments",
    tag = "webhooks",
    summary = "Payment gateway webhook",
    description = "Razorpay: hex HMAC-SHA256 of the raw body in `X-Razorpay-Signature`; `payment.captured` and \
                   `order.paid` settle the order. Stripe: `Stripe-Signature` over `{t}.{body}`; \
                   `checkout.session.completed` and `checkout.session.async_payment_succeeded` settle a paid session.",
    request_body(content = String, description = "Raw gateway event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event handled", body = PaymentWebhookAck),
        (status = 400, description = "Malformed event"),
        (status = 401, description = "Signature rejected"),
    )
)]
#[instrument(skip_all)]
pub async fn payment_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<PaymentWebhookAck>> {
    let outcome = match state.payments.handle_webhook(&headers, &body).await {
        Ok(Some(VerifyOutcome::Settled(_))) => PaymentWebhookOutcome::Settled,
        Ok(Some(VerifyOutcome::AlreadySettled(_))) => PaymentWebhookOutcome::AlreadySettled,
        Ok(None) => PaymentWebhookOutcome::Ignored,
        Err(PaymentError::OrderNotFound(order_id)) => {
            info!(%order_id, "Payment event for an unknown order");
            PaymentWebhookOutcome::UnknownOrder
        }
        Err(PaymentError::NotPending { order_id, status }) => {
            info!(%order_id, %status, "Payment event for an order that is no longer pending");
            PaymentWebhookOutcome::NotPending
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(PaymentWebhookAck { outcome }))
}

#[cfg(test)]
mod tests {
    use crate::api::models::credits::BalanceResponse;
    use crate::api::models::jobs::{JobResponse, SubmitJobResponse};
    use crate::api::models::payments::OrderResponse;
    use crate::api::models::webhooks::{PaymentWebhookAck, PaymentWebhookOutcome};
    use crate::config::DummyPaymentConfig;
    use crate::jobs::types::{FailureReason, JobState};
    use crate::payment_providers::SIGNATURE_HEADER;
    use crate::test_utils::{TEST_USER_HEADER, create_test_app};
    use crate::webhooks::signing::hmac_sha256_hex;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn submitted_job(server: &axum_test::TestServer, ctx: &crate::test_utils::TestContext, correlation_id: &str) -> SubmitJobResponse {
        ctx.provider.add_submit_result(Ok(correlation_id.to_string()));
        server
            .post("/api/v1/jobs")
            .add_header(TEST_USER_HEADER, "lena")
            .json(&json!({"kind": "GENERATE", "payload": {"prompt": "fog"}}))
            .await
            .json()
    }

    #[tokio::test]
    async fn test_provider_webhook_completes_job() {
        let (server, ctx) = create_test_app().await;
        let created = submitted_job(&server, &ctx, "pred-ok").await;

        let response = server
            .post("/webhooks/provider")
            .json(&json!({"id": "pred-ok", "status": "succeeded", "output": ["https://cdn.example.com/out.png"]}))
            .await;
        response.assert_status_ok();
        response.assert_json(&json!({"outcome": "applied"}));

        let job: JobResponse = server
            .get(&format!("/api/v1/jobs/{}", created.job_id))
            .add_header(TEST_USER_HEADER, "lena")
            .await
            .json();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result_ref.as_deref(), Some("https://cdn.example.com/out.png"));

        // A second terminal signal for the same job is dropped
        server
            .post("/webhooks/provider")
            .json(&json!({"id": "pred-ok", "status": "failed", "error": "late"}))
            .await
            .assert_json(&json!({"outcome": "late"}));
    }

    #[tokio::test]
    async fn test_provider_failure_webhook_refunds() {
        let (server, ctx) = create_test_app().await;
        let created = submitted_job(&server, &ctx, "pred-bad").await;

        server
            .post("/webhooks/provider")
            .json(&json!({"externalCorrelationId": "pred-bad", "status": "failed", "error": "NSFW"}))
            .await
            .assert_json(&json!({"outcome": "applied"}));

        let job: JobResponse = server
            .get(&format!("/api/v1/jobs/{}", created.job_id))
            .add_header(TEST_USER_HEADER, "lena")
            .await
            .json();
        assert_eq!(job.failure_reason, Some(FailureReason::ProviderFailed));
        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "lena")
            .await
            .json();
        assert_eq!(balance.credits, 100);
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_acknowledged() {
        let (server, _ctx) = create_test_app().await;
        server
            .post("/webhooks/provider")
            .json(&json!({"id": "pred-nobody", "status": "succeeded"}))
            .await
            .assert_json(&json!({"outcome": "unknown_correlation"}));

        server
            .post("/webhooks/provider")
            .text("not json")
            .await
            .assert_status_bad_request();
    }

    #[tokio::test]
    async fn test_payment_webhook_settles_once() {
        let (server, _ctx) = create_test_app().await;
        let order: OrderResponse = server
            .post("/api/v1/payments/orders")
            .add_header(TEST_USER_HEADER, "mia")
            .json(&json!({"plan": "premium"}))
            .await
            .json();

        let body = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_9", "order_id": order.order_id}}}
        })
        .to_string();
        let signature = hmac_sha256_hex(DummyPaymentConfig::default().secret.as_bytes(), body.as_bytes());

        let deliver = || {
            server
                .post("/webhooks/payments")
                .add_header(SIGNATURE_HEADER, signature.as_str())
                .bytes(body.clone().into())
        };
        let first: PaymentWebhookAck = deliver().await.json();
        assert_eq!(first.outcome, PaymentWebhookOutcome::Settled);
        let second: PaymentWebhookAck = deliver().await.json();
        assert_eq!(second.outcome, PaymentWebhookOutcome::AlreadySettled);

        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "mia")
            .await
            .json();
        assert_eq!(balance.credits, 1100);
    }

    #[tokio::test]
    async fn test_payment_webhook_signature_and_unknown_order() {
        let (server, _ctx) = create_test_app().await;
        let body = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_1", "order_id": "order_missing"}}}
        })
        .to_string();

        server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, "00ff")
            .bytes(body.clone().into())
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let signature = hmac_sha256_hex(DummyPaymentConfig::default().secret.as_bytes(), body.as_bytes());
        let ack: PaymentWebhookAck = server
            .post("/webhooks/payments")
            .add_header(SIGNATURE_HEADER, signature.as_str())
            .bytes(body.into())
            .await
            .json();
        assert_eq!(ack.outcome, PaymentWebhookOutcome::UnknownOrder);
    }

    #[tokio::test]
    async fn test_stripe_checkout_webhook_settles_paid_session() {
        use crate::config::StripeConfig;
        use crate::payment_providers::stripe::{STRIPE_SIGNATURE_HEADER, StripeProvider};
        use crate::test_utils::{create_test_app_with_gateway, create_test_config};
        use std::sync::Arc;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let stripe = MockServer::start().await;
        let session = |payment_status: &str| {
            json!({
                "id": "cs_test_77",
                "object": "checkout.session",
                "url": "https://checkout.stripe.com/c/pay/cs_test_77",
                "amount_total": 800000,
                "currency": "inr",
                "payment_status": payment_status,
                "payment_intent": "pi_77",
            })
        };
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session("unpaid")))
            .mount(&stripe)
            .await;
        let gateway = StripeProvider::new(StripeConfig {
            api_key: "sk_test_key".to_string(),
            webhook_secret: "whsec_test".to_string(),
            success_url: "https://app.example/credits".parse().unwrap(),
            cancel_url: "https://app.example/credits".parse().unwrap(),
            base_url: stripe.uri().parse().unwrap(),
        })
        .unwrap();
        let (server, _ctx) = create_test_app_with_gateway(create_test_config(), Arc::new(gateway)).await;

        let order: OrderResponse = server
            .post("/api/v1/payments/orders")
            .add_header(TEST_USER_HEADER, "olga")
            .json(&json!({"plan": "premium"}))
            .await
            .json();
        assert_eq!(order.order_id, "cs_test_77");

        let deliver = |event_type: &str, payment_status: &str| {
            let body = json!({"id": "evt_1", "type": event_type, "data": {"object": session(payment_status)}}).to_string();
            let timestamp = chrono::Utc::now().timestamp();
            let signature = hmac_sha256_hex(b"whsec_test", format!("{timestamp}.{body}").as_bytes());
            server
                .post("/webhooks/payments")
                .add_header(STRIPE_SIGNATURE_HEADER, format!("t={timestamp},v1={signature}"))
                .bytes(body.into())
        };

        let pending: PaymentWebhookAck = deliver("checkout.session.completed", "unpaid").await.json();
        assert_eq!(pending.outcome, PaymentWebhookOutcome::Ignored);
        let paid: PaymentWebhookAck = deliver("checkout.session.async_payment_succeeded", "paid").await.json();
        assert_eq!(paid.outcome, PaymentWebhookOutcome::Settled);
        let replay: PaymentWebhookAck = deliver("checkout.session.completed", "paid").await.json();
        assert_eq!(replay.outcome, PaymentWebhookOutcome::AlreadySettled);

        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "olga")
            .await
            .json();
        assert_eq!(balance.credits, 1100);
    }
}
