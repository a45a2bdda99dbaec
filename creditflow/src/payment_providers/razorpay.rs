//! Razorpay orders API.
//!
//! - Orders: `POST /v1/orders` with basic auth `key_id:key_secret`
//! - Payment proof: hex HMAC-SHA256 of `"{order_id}|{payment_id}"` keyed with `key_secret`
//! - Webhooks: hex HMAC-SHA256 of the raw body keyed with `webhook_secret`, in `X-Razorpay-Signature`

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::json;
use std::time::Duration;

use super::{GatewayOrder, OrderRequest, PaymentConfirmation, PaymentError, PaymentProvider, Result};
use crate::config::RazorpayConfig;
use crate::webhooks::signing::verify_hex_signature;

pub struct RazorpayProvider {
    client: reqwest::Client,
    config: RazorpayConfig,
}

impl RazorpayProvider {
    pub fn new(config: RazorpayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PaymentProvider for RazorpayProvider {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    fn key_id(&self) -> Option<String> {
        Some(self.config.key_id.clone())
    }

    #[tracing::instrument(skip(self, request), fields(receipt = %request.receipt))]
    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder> {
        let url = format!("{}/v1/orders", self.config.base_url.as_str().trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&json!({
                "amount": request.amount,
                "currency": request.currency,
                "receipt": request.receipt,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, %body, "Razorpay order creation failed");
            return Err(PaymentError::ProviderApi(format!("order creation returned {status}")));
        }

        let order: GatewayOrder = response.json().await?;
        tracing::debug!(order_id = %order.order_id, "Razorpay order created");
        Ok(order)
    }

    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_hex_signature(
            self.config.key_secret.as_bytes(),
            format!("{order_id}|{payment_id}").as_bytes(),
            signature,
        )
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<PaymentConfirmation>> {
        let signature = super::signature_header(headers)?;
        if !verify_hex_signature(self.config.webhook_secret.as_bytes(), body, signature) {
            return Err(PaymentError::InvalidSignature);
        }
        super::parse_gateway_event(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment_providers::SIGNATURE_HEADER;
    use crate::webhooks::signing::hmac_sha256_hex;
    use wiremock::matchers::{basic_auth, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> RazorpayProvider {
        RazorpayProvider::new(RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: "key_secret".to_string(),
            webhook_secret: "hook_secret".to_string(),
            base_url: server.uri().parse().unwrap(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(basic_auth("rzp_test_key", "key_secret"))
            .and(body_json(json!({"amount": 400000, "currency": "INR", "receipt": "rcpt_1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "order_Ab12",
                "entity": "order",
                "amount": 400000,
                "currency": "INR",
                "status": "created",
            })))
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
                order_id: "order_Ab12".to_string(),
                amount: 400000,
                currency: "INR".to_string(),
                checkout_url: None,
            }
        );
    }

    #[tokio::test]
    async fn test_create_order_error_hides_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {"description": "bad key"}})))
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
            PaymentError::ProviderApi(message) => assert!(!message.contains("bad key")),
            other => panic!("expected ProviderApi, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payment_proof_uses_key_secret() {
        let server = MockServer::start().await;
        let p = provider(&server);
        let good = hmac_sha256_hex(b"key_secret", b"order_1|pay_1");
        let wrong_key = hmac_sha256_hex(b"hook_secret", b"order_1|pay_1");
        assert!(p.verify_payment("order_1", "pay_1", &good));
        assert!(!p.verify_payment("order_1", "pay_1", &wrong_key));
        assert!(!p.verify_payment("order_2", "pay_1", &good));
    }

    #[tokio::test]
    async fn test_webhook_uses_webhook_secret() {
        let server = MockServer::start().await;
        let p = provider(&server);
        let body = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_9", "order_id": "order_9"}}}
        })
        .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, hmac_sha256_hex(b"key_secret", body.as_bytes()).parse().unwrap());
        assert!(matches!(p.parse_webhook(&headers, body.as_bytes()), Err(PaymentError::InvalidSignature)));

        headers.insert(SIGNATURE_HEADER, hmac_sha256_hex(b"hook_secret", body.as_bytes()).parse().unwrap());
        assert_eq!(
            p.parse_webhook(&headers, body.as_bytes()).unwrap(),
            Some(PaymentConfirmation {
                order_id: "order_9".to_string(),
                payment_id: "pay_9".to_string(),
            })
        );
    }
}
