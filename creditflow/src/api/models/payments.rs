use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::payments::{Subscription, Transaction, TransactionStatus};
use crate::payments::CreatedOrder;
use crate::types::TransactionId;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: String,
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    /// Gateway public key for the checkout widget
    pub key_id: Option<String>,
    /// Hosted checkout page to send the user to, for gateways that collect the payment themselves
    pub checkout_url: Option<String>,
    pub plan: String,
    pub credits: i64,
}

impl From<CreatedOrder> for OrderResponse {
    fn from(order: CreatedOrder) -> Self {
        Self {
            order_id: order.order_id,
            amount: order.amount,
            currency: order.currency,
            key_id: order.key_id,
            checkout_url: order.checkout_url,
            plan: order.plan,
            credits: order.credits,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub order_id: String,
    pub payment_id: String,
    /// Hex HMAC-SHA256 of `"{orderId}|{paymentId}"` as returned by the checkout
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmCheckoutRequest {
    /// Order id returned when the order was created (the checkout session id)
    #[serde(alias = "sessionId")]
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentResponse {
    pub success: bool,
    /// True when the order had already been settled by an earlier confirmation
    pub already_settled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TransactionId,
    pub order_id: String,
    pub payment_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub plan: String,
    pub credits: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.id,
            order_id: t.order_id,
            payment_id: t.payment_id,
            amount: t.amount,
            currency: t.currency,
            plan: t.plan,
            credits: t.credits,
            status: t.status,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub plan: String,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(s: Subscription) -> Self {
        Self {
            plan: s.plan,
            order_id: s.order_id,
            created_at: s.created_at,
        }
    }
}
