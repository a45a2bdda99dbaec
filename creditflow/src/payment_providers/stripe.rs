//! Stripe Checkout.
//!
//! - Orders: a hosted Checkout Session, `POST /v1/checkout/sessions` (form encoded, bearer API key).
//!   The session id is the order id and the client is sent to the session's `url`.
//! - Return from checkout: `GET /v1/checkout/sessions/{id}`; the order is paid once
//!   `payment_status` is `paid`.
//! - Webhooks: `Stripe-Signature: t=<unix>,v1=<hex>` where the signature is the hex HMAC-SHA256 of
//!   `"{t}.{body}"` keyed with the endpoint's signing secret.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::{GatewayOrder, OrderRequest, PaymentConfirmation, PaymentError, PaymentProvider, Result};
use crate::config::StripeConfig;
use crate::webhooks::signing::verify_hex_signature;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Largest accepted age of a signed webhook timestamp, in either direction.
const WEBHOOK_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    url: Option<String>,
    amount_total: Option<i64>,
    currency: Option<String>,
    payment_status: String,
    payment_intent: Option<String>,
}

impl CheckoutSession {
    fn confirmation(self) -> Option<PaymentConfirmation> {
        if self.payment_status != "paid" {
            return None;
        }
        Some(PaymentConfirmation {
            payment_id: self.payment_intent.unwrap_or_else(|| self.id.clone()),
            order_id: self.id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

pub struct StripeProvider {
    client: reqwest::Client,
    config: StripeConfig,
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, config })
    }

    fn sessions_url(&self) -> String {
        format!("{}/v1/checkout/sessions", self.config.base_url.as_str().trim_end_matches('/'))
    }

    /// Check a `Stripe-Signature` header against `body` as of `now`.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], now: DateTime<Utc>) -> Result<()> {
        let header = headers
            .get(STRIPE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(PaymentError::InvalidSignature)?;
        if (now.timestamp() - timestamp).unsigned_abs() > WEBHOOK_TOLERANCE.as_secs() {
            tracing::debug!(timestamp, "Stripe webhook timestamp outside tolerance");
            return Err(PaymentError::InvalidSignature);
        }

        let mut signed = format!("{timestamp}.").into_bytes();
        signed.extend_from_slice(body);
        let secret = self.config.webhook_secret.as_bytes();
        if signatures.iter().any(|candidate| verify_hex_signature(secret, &signed, candidate)) {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature)
        }
    }

    fn parse_webhook_at(&self, headers: &HeaderMap, body: &[u8], now: DateTime<Utc>) -> Result<Option<PaymentConfirmation>> {
        self.verify_signature(headers, body, now)?;

        let event: StripeEvent =
            serde_json::from_slice(body).map_err(|e| PaymentError::InvalidData(format!("malformed webhook body: {e}")))?;
        if event.event_type != "checkout.session.completed" && event.event_type != "checkout.session.async_payment_succeeded" {
            tracing::debug!(event = %event.event_type, "Ignoring Stripe webhook event");
            return Ok(None);
        }

        let session: CheckoutSession = serde_json::from_value(event.data.object)
            .map_err(|e| PaymentError::InvalidData(format!("{} event without a checkout session: {e}", event.event_type)))?;
        if session.payment_status != "paid" {
            // Delayed payment methods complete the session first and pay later
            tracing::debug!(session_id = %session.id, payment_status = %session.payment_status, "Checkout session not paid yet");
        }
        Ok(session.confirmation())
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn key_id(&self) -> Option<String> {
        None
    }

    #[tracing::instrument(skip(self, request), fields(receipt = %request.receipt))]
    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder> {
        let amount = request.amount.to_string();
        let currency = request.currency.to_lowercase();
        let form = [
            ("mode", "payment"),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", currency.as_str()),
            ("line_items[0][price_data][unit_amount]", amount.as_str()),
            ("line_items[0][price_data][product_data][name]", request.description.as_str()),
            ("client_reference_id", request.receipt.as_str()),
            ("success_url", self.config.success_url.as_str()),
            ("cancel_url", self.config.cancel_url.as_str()),
        ];

        let response = self
            .client
            .post(self.sessions_url())
            .bearer_auth(&self.config.api_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, %body, "Stripe checkout session creation failed");
            return Err(PaymentError::ProviderApi(format!("checkout session creation returned {status}")));
        }

        let session: CheckoutSession = response.json().await?;
        let checkout_url = session.url.ok_or_else(|| {
            tracing::error!(session_id = %session.id, "Checkout session missing URL");
            PaymentError::ProviderApi("checkout session missing URL".to_string())
        })?;
        tracing::debug!(session_id = %session.id, "Stripe checkout session created");

        Ok(GatewayOrder {
            order_id: session.id,
            amount: session.amount_total.unwrap_or(request.amount),
            currency: session.currency.map_or_else(|| request.currency.clone(), |c| c.to_uppercase()),
            checkout_url: Some(checkout_url),
        })
    }

    /// Checkout collects the payment itself; there is no client-side proof to check.
    fn verify_payment(&self, _order_id: &str, _payment_id: &str, _signature: &str) -> bool {
        false
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<PaymentConfirmation>> {
        self.parse_webhook_at(headers, body, Utc::now())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_confirmation(&self, order_id: &str) -> Result<Option<PaymentConfirmation>> {
        if order_id.is_empty() || !order_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PaymentError::InvalidData("Invalid Stripe session ID".to_string()));
        }

        let response = self
            .client
            .get(format!("{}/{order_id}", self.sessions_url()))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PaymentError::OrderNotFound(order_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, %body, "Stripe checkout session lookup failed");
            return Err(PaymentError::ProviderApi(format!("checkout session lookup returned {status}")));
        }

        let session: CheckoutSession = response.json().await?;
        tracing::debug!(payment_status = %session.payment_status, "Stripe checkout session retrieved");
        Ok(session.confirmation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::signing::hmac_sha256_hex;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> StripeProvider {
        StripeProvider::new(StripeConfig {
            api_key: "sk_test_key".to_string(),
            webhook_secret: "whsec_test".to_string(),
            success_url: "https://app.example/credits?session_id={CHECKOUT_SESSION_ID}".parse().unwrap(),
            cancel_url: "https://app.example/credits".parse().unwrap(),
            base_url: server.uri().parse().unwrap(),
        })
        .unwrap()
    }

    fn session(payment_status: &str) -> serde_json::Value {
        json!({
            "id": "cs_test_a1",
            "object": "checkout.session",
            "url": "https://checkout.stripe.com/c/pay/cs_test_a1",
            "amount_total": 400000,
            "currency": "inr",
            "client_reference_id": "rcpt_1",
            "payment_status": payment_status,
            "payment_intent": "pi_1",
        })
    }

    fn signed_headers(body: &str, timestamp: i64, secret: &str) -> HeaderMap {
        let signature = hmac_sha256_hex(secret.as_bytes(), format!("{timestamp}.{body}").as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(STRIPE_SIGNATURE_HEADER, format!("t={timestamp},v1={signature}").parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_create_checkout_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test_key"))
            .and(body_string_contains("mode=payment"))
            .and(body_string_contains("line_items%5B0%5D%5Bprice_data%5D%5Bunit_amount%5D=400000"))
            .and(body_string_contains("line_items%5B0%5D%5Bprice_data%5D%5Bcurrency%5D=inr"))
            .and(body_string_contains("client_reference_id=rcpt_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session("unpaid")))
            .expect(1)
            .mount(&server)
            .await;

        let order = provider(&server)
            .create_order(&OrderRequest {
                amount: 400000,
                currency: "INR".to_string(),
                receipt: "rcpt_1".to_string(),
                description: "basic plan".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            order,
            GatewayOrder {
                order_id: "cs_test_a1".to_string(),
                amount: 400000,
                currency: "INR".to_string(),
                checkout_url: Some("https://checkout.stripe.com/c/pay/cs_test_a1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_create_session_error_hides_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "Invalid API Key sk_test_key"}})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_order(&OrderRequest {
                amount: 1,
                currency: "INR".to_string(),
                receipt: "r".to_string(),
                description: "basic plan".to_string(),
            })
            .await
            .unwrap_err();
        match err {
            PaymentError::ProviderApi(message) => assert!(!message.contains("sk_test_key")),
            other => panic!("expected ProviderApi, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_confirmation_requires_paid_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session("unpaid")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session("paid")))
            .mount(&server)
            .await;

        let p = provider(&server);
        assert_eq!(p.fetch_confirmation("cs_test_a1").await.unwrap(), None);
        assert_eq!(
            p.fetch_confirmation("cs_test_a1").await.unwrap(),
            Some(PaymentConfirmation {
                order_id: "cs_test_a1".to_string(),
                payment_id: "pi_1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_confirmation_rejects_bad_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": {"code": "resource_missing"}})))
            .mount(&server)
            .await;

        let p = provider(&server);
        assert!(matches!(
            p.fetch_confirmation("../customers").await,
            Err(PaymentError::InvalidData(_))
        ));
        assert!(matches!(
            p.fetch_confirmation("cs_test_gone").await,
            Err(PaymentError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_signature() {
        let server = MockServer::start().await;
        let p = provider(&server);
        let now = Utc::now();
        let body = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": session("paid")},
        })
        .to_string();

        let headers = signed_headers(&body, now.timestamp(), "whsec_test");
        assert_eq!(
            p.parse_webhook_at(&headers, body.as_bytes(), now).unwrap(),
            Some(PaymentConfirmation {
                order_id: "cs_test_a1".to_string(),
                payment_id: "pi_1".to_string(),
            })
        );

        let wrong_secret = signed_headers(&body, now.timestamp(), "whsec_other");
        assert!(matches!(
            p.parse_webhook_at(&wrong_secret, body.as_bytes(), now),
            Err(PaymentError::InvalidSignature)
        ));

        let stale = signed_headers(&body, now.timestamp() - 600, "whsec_test");
        assert!(matches!(
            p.parse_webhook_at(&stale, body.as_bytes(), now),
            Err(PaymentError::InvalidSignature)
        ));

        assert!(matches!(
            p.parse_webhook_at(&HeaderMap::new(), body.as_bytes(), now),
            Err(PaymentError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_webhook_events() {
        let server = MockServer::start().await;
        let p = provider(&server);
        let now = Utc::now();
        let parse = |event_type: &str, object: serde_json::Value| {
            let body = json!({"id": "evt_1", "type": event_type, "data": {"object": object}}).to_string();
            p.parse_webhook_at(&signed_headers(&body, now.timestamp(), "whsec_test"), body.as_bytes(), now)
        };

        // Completed but still waiting for a delayed payment method
        assert_eq!(parse("checkout.session.completed", session("unpaid")).unwrap(), None);
        assert!(
            parse("checkout.session.async_payment_succeeded", session("paid"))
                .unwrap()
                .is_some()
        );
        assert_eq!(parse("charge.refunded", json!({"id": "ch_1"})).unwrap(), None);
        assert!(matches!(
            parse("checkout.session.completed", json!({"id": "cs_1"})),
            Err(PaymentError::InvalidData(_))
        ));
    }
}
