//! Dummy payment gateway for local development.
//!
//! Orders are created locally. Payment proofs and webhook signatures use the same HMAC scheme as the
//! Razorpay gateway, keyed with the configured shared secret, so a developer can sign them by hand.

use async_trait::async_trait;
use axum::http::HeaderMap;
use uuid::Uuid;

use super::{GatewayOrder, OrderRequest, PaymentConfirmation, PaymentError, PaymentProvider, Result};
use crate::config::DummyPaymentConfig;
use crate::webhooks::signing::verify_hex_signature;

pub struct DummyPaymentProvider {
    secret: String,
}

impl From<DummyPaymentConfig> for DummyPaymentProvider {
    fn from(config: DummyPaymentConfig) -> Self {
        Self { secret: config.secret }
    }
}

#[async_trait]
impl PaymentProvider for DummyPaymentProvider {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn key_id(&self) -> Option<String> {
        None
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder> {
        let order = GatewayOrder {
            order_id: format!("order_dummy_{}", Uuid::new_v4().simple()),
            amount: request.amount,
            currency: request.currency.clone(),
            checkout_url: None,
        };
        tracing::info!(order_id = %order.order_id, receipt = %request.receipt, "Dummy gateway created order");
        Ok(order)
    }

    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_hex_signature(self.secret.as_bytes(), format!("{order_id}|{payment_id}").as_bytes(), signature)
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<PaymentConfirmation>> {
        let signature = super::signature_header(headers)?;
        if !verify_hex_signature(self.secret.as_bytes(), body, signature) {
            return Err(PaymentError::InvalidSignature);
        }
        super::parse_gateway_event(body)
    }
}
