//! Payment gateway abstraction.
//!
//! A gateway creates orders for the checkout collaborator and vouches for completed payments, either
//! through a payment proof the client relays back, by looking the order up when the client returns
//! from a hosted checkout page, or through a signed webhook. Implementations never touch storage;
//! settling an order is the reconciler's job.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::PaymentConfig;
use crate::db::errors::DbError;
use crate::db::models::payments::TransactionStatus;

pub mod dummy;
pub mod razorpay;
pub mod stripe;

/// Header carrying the hex HMAC-SHA256 of a gateway webhook body.
pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Create a payment gateway from configuration
pub fn create_provider(config: &PaymentConfig) -> anyhow::Result<Arc<dyn PaymentProvider>> {
    Ok(match config {
        PaymentConfig::Razorpay(razorpay_config) => Arc::new(razorpay::RazorpayProvider::new(razorpay_config.clone())?),
        PaymentConfig::Stripe(stripe_config) => Arc::new(stripe::StripeProvider::new(stripe_config.clone())?),
        PaymentConfig::Dummy(dummy_config) => Arc::new(dummy::DummyPaymentProvider::from(dummy_config.clone())),
    })
}

/// Result type for payment operations
pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    /// A payment proof or webhook signature did not verify
    #[error("Payment signature verification failed")]
    InvalidSignature,

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Order {0} not found")]
    OrderNotFound(String),

    /// The order can no longer be settled (failed or abandoned)
    #[error("Order {order_id} is {status}")]
    NotPending { order_id: String, status: TransactionStatus },

    /// The hosted checkout has not collected the payment yet
    #[error("Payment for order {0} not completed yet")]
    PaymentNotCompleted(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::ProviderApi(err.to_string())
    }
}

/// Order to create with the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    /// Merchant reference shown in the gateway dashboard
    pub receipt: String,
    /// What the customer is buying, for gateways that show a checkout page
    pub description: String,
}

/// Order as created by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayOrder {
    #[serde(rename = "id")]
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    /// Hosted page the client is sent to, for gateways that collect the payment themselves
    #[serde(skip)]
    pub checkout_url: Option<String>,
}

/// A payment the gateway confirmed for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub payment_id: String,
}

/// Abstract payment gateway interface
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Public key handed to the checkout collaborator, if the gateway uses one.
    fn key_id(&self) -> Option<String>;

    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder>;

    /// Check the proof the client relays after checkout. Comparison is constant-time.
    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// Verify a webhook and extract the payment it confirms.
    ///
    /// Returns `Ok(None)` for verified events that do not settle an order and
    /// [`PaymentError::InvalidSignature`] when the signature does not verify.
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<PaymentConfirmation>>;

    /// Ask the gateway whether `order_id` has been paid.
    ///
    /// Used when the client returns from a hosted checkout page. `Ok(None)` means the payment has not
    /// been collected yet. Gateways that confirm through payment proofs do not support lookups.
    async fn fetch_confirmation(&self, order_id: &str) -> Result<Option<PaymentConfirmation>> {
        Err(PaymentError::InvalidData(format!(
            "{} orders are confirmed with a payment proof, not looked up (order {order_id})",
            self.name()
        )))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayEvent {
    event: String,
    #[serde(default)]
    payload: EventPayload,
}

#[derive(Debug, Default, Deserialize)]
struct EventPayload {
    payment: Option<Wrapped<PaymentEntity>>,
    order: Option<Wrapped<OrderEntity>>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEntity {
    id: String,
}

/// Signature header value, or `InvalidSignature` when absent.
pub(crate) fn signature_header(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(PaymentError::InvalidSignature)
}

/// Extract the confirmed payment from a verified `payment.captured` or `order.paid` event.
pub(crate) fn parse_gateway_event(body: &[u8]) -> Result<Option<PaymentConfirmation>> {
    let event: GatewayEvent =
        serde_json::from_slice(body).map_err(|e| PaymentError::InvalidData(format!("malformed webhook body: {e}")))?;

    if event.event != "payment.captured" && event.event != "order.paid" {
        tracing::debug!(event = %event.event, "Ignoring payment webhook event");
        return Ok(None);
    }

    let payment = event
        .payload
        .payment
        .ok_or_else(|| PaymentError::InvalidData(format!("{} event without a payment", event.event)))?
        .entity;
    let order_id = payment
        .order_id
        .or(event.payload.order.map(|o| o.entity.id))
        .ok_or_else(|| PaymentError::InvalidData(format!("{} event without an order id", event.event)))?;

    Ok(Some(PaymentConfirmation {
        order_id,
        payment_id: payment.id,
    }))
}
