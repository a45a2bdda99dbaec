use crate::db::models::credits::LedgerEntry;
use crate::types::{SubscriptionId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment order created with the gateway and its settlement status.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Gateway-assigned order id; also the idempotency key of the credit entry
    pub order_id: String,
    pub payment_id: Option<String>,
    pub payment_proof: Option<String>,
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    pub plan: String,
    /// Credits granted when the order settles, fixed at order creation
    pub credits: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub plan: String,
    pub credits: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan: String,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

/// Proof of payment to settle a pending order with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleRequest {
    pub order_id: String,
    pub payment_id: String,
    pub payment_proof: Option<String>,
}

/// Result of an atomic settle: status flip, credit entry and subscription together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled {
        transaction: Transaction,
        entry: LedgerEntry,
        subscription: Subscription,
    },
    /// The order had already been settled by an earlier confirmation
    AlreadySettled(Transaction),
    /// The order is FAILED (abandoned or rejected) and will never be credited
    NotPending(Transaction),
}
