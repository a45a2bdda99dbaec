//! Turns verified payments into credits, exactly once per order.
//!
//! Settlement is a single store operation: the transaction flips PENDING → SUCCESS, a
//! PAYMENT_CREDIT entry keyed by the order id is applied and a subscription is appended, or none of
//! it happens. Redelivered confirmations find the order already settled and change nothing.

use axum::http::HeaderMap;
use chrono::Utc;
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{PaymentsConfig, PlanConfig};
use crate::db::Storage;
use crate::db::models::payments::{NewTransaction, SettleRequest, Settlement, Subscription, Transaction, TransactionStatus};
use crate::payment_providers::{OrderRequest, PaymentConfirmation, PaymentError, PaymentProvider, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{time_after, time_before};

/// An order ready for checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOrder {
    pub order_id: String,
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    pub key_id: Option<String>,
    /// Hosted checkout page, when the gateway collects the payment itself
    pub checkout_url: Option<String>,
    pub plan: String,
    pub credits: i64,
}

/// Result of a successful verification or confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// This call settled the order and credited the account
    Settled(Transaction),
    /// The order had already been settled; nothing changed
    AlreadySettled(Transaction),
}

impl VerifyOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            VerifyOutcome::Settled(t) | VerifyOutcome::AlreadySettled(t) => t,
        }
    }
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn Storage>,
    gateway: Arc<dyn PaymentProvider>,
    plans: BTreeMap<String, PlanConfig>,
    config: PaymentsConfig,
    retry: RetryPolicy,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn Storage>,
        gateway: Arc<dyn PaymentProvider>,
        plans: BTreeMap<String, PlanConfig>,
        config: PaymentsConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            plans,
            config,
            retry,
        }
    }

    /// Create a gateway order for `plan` and record it as PENDING.
    #[instrument(skip(self), err)]
    pub async fn create_order(&self, user_id: &str, plan: &str) -> Result<CreatedOrder> {
        let plan_config = self
            .plans
            .get(plan)
            .ok_or_else(|| PaymentError::UnknownPlan(plan.to_string()))?;

        let order = self
            .gateway
            .create_order(&OrderRequest {
                amount: plan_config.minor_amount(),
                currency: plan_config.currency.clone(),
                receipt: format!("rcpt_{}", Uuid::new_v4().simple()),
                description: format!("{plan} plan, {} credits", plan_config.credits),
            })
            .await?;

        let transaction = NewTransaction {
            user_id: user_id.to_string(),
            order_id: order.order_id.clone(),
            amount: order.amount,
            currency: order.currency.clone(),
            plan: plan.to_string(),
            credits: plan_config.credits,
        };
        with_retry(&self.retry, "insert_transaction", || self.store.insert_transaction(&transaction)).await?;
        info!(order_id = %order.order_id, gateway = self.gateway.name(), "Payment order created");

        Ok(CreatedOrder {
            order_id: order.order_id,
            amount: order.amount,
            currency: order.currency,
            key_id: self.gateway.key_id(),
            checkout_url: order.checkout_url,
            plan: plan.to_string(),
            credits: plan_config.credits,
        })
    }

    /// Verify the proof relayed by the client and settle the order.
    ///
    /// A signature mismatch is rejected before anything is read or written.
    #[instrument(skip(self, signature))]
    pub async fn verify(&self, user_id: &str, order_id: &str, payment_id: &str, signature: &str) -> Result<VerifyOutcome> {
        if !self.gateway.verify_payment(order_id, payment_id, signature) {
            warn!(target: "security", %user_id, %order_id, %payment_id, "Payment signature mismatch");
            counter!("creditflow_payments_rejected_total").increment(1);
            return Err(PaymentError::InvalidSignature);
        }

        let transaction = self.load(order_id).await?;
        if transaction.user_id != user_id {
            warn!(target: "security", %user_id, %order_id, "Payment verification for another user's order");
            return Err(PaymentError::OrderNotFound(order_id.to_string()));
        }

        let request = SettleRequest {
            order_id: order_id.to_string(),
            payment_id: payment_id.to_string(),
            payment_proof: Some(signature.to_string()),
        };
        self.settle(&transaction, &request).await
    }

    /// Settle an order after the client returns from the gateway's hosted checkout.
    ///
    /// The gateway is asked whether the order was paid; an order it has not collected yet is
    /// refused with [`PaymentError::PaymentNotCompleted`] and stays PENDING.
    #[instrument(skip(self))]
    pub async fn confirm_checkout(&self, user_id: &str, order_id: &str) -> Result<VerifyOutcome> {
        let transaction = self.load(order_id).await?;
        if transaction.user_id != user_id {
            warn!(target: "security", %user_id, %order_id, "Checkout confirmation for another user's order");
            return Err(PaymentError::OrderNotFound(order_id.to_string()));
        }
        if transaction.status == TransactionStatus::Success {
            debug!(%order_id, "Order already settled");
            return Ok(VerifyOutcome::AlreadySettled(transaction));
        }

        let confirmation = self
            .gateway
            .fetch_confirmation(order_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotCompleted(order_id.to_string()))?;
        if confirmation.order_id != order_id {
            return Err(PaymentError::InvalidData(format!(
                "gateway confirmed order {} when asked for {order_id}",
                confirmation.order_id
            )));
        }

        let request = SettleRequest {
            order_id: order_id.to_string(),
            payment_id: confirmation.payment_id,
            payment_proof: None,
        };
        self.settle(&transaction, &request).await
    }

    /// Verify and apply a gateway webhook. `Ok(None)` for events that settle nothing.
    #[instrument(skip_all)]
    pub async fn handle_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<Option<VerifyOutcome>> {
        let confirmation = match self.gateway.parse_webhook(headers, body) {
            Ok(Some(confirmation)) => confirmation,
            Ok(None) => return Ok(None),
            Err(PaymentError::InvalidSignature) => {
                warn!(target: "security", gateway = self.gateway.name(), "Payment webhook signature mismatch");
                counter!("creditflow_payments_rejected_total").increment(1);
                return Err(PaymentError::InvalidSignature);
            }
            Err(e) => return Err(e),
        };
        self.confirm(&confirmation).await.map(Some)
    }

    /// Settle an order the gateway confirmed out of band.
    #[instrument(skip(self), fields(order_id = %confirmation.order_id))]
    pub async fn confirm(&self, confirmation: &PaymentConfirmation) -> Result<VerifyOutcome> {
        let transaction = self.load(&confirmation.order_id).await?;
        let request = SettleRequest {
            order_id: confirmation.order_id.clone(),
            payment_id: confirmation.payment_id.clone(),
            payment_proof: None,
        };
        self.settle(&transaction, &request).await
    }

    async fn load(&self, order_id: &str) -> Result<Transaction> {
        self.store
            .get_transaction_by_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))
    }

    async fn settle(&self, transaction: &Transaction, request: &SettleRequest) -> Result<VerifyOutcome> {
        let deadline = time_after(transaction.created_at, self.config.order_deadline);
        if transaction.status == TransactionStatus::Pending && Utc::now() >= deadline {
            warn!(order_id = %transaction.order_id, "Payment arrived for an abandoned order");
            let status = with_retry(&self.retry, "fail_transaction", || self.store.fail_transaction(&request.order_id))
                .await?
                .map_or(TransactionStatus::Failed, |t| t.status);
            if status != TransactionStatus::Success {
                return Err(PaymentError::NotPending {
                    order_id: request.order_id.clone(),
                    status,
                });
            }
        }

        match with_retry(&self.retry, "settle_transaction", || self.store.settle_transaction(request)).await? {
            Settlement::Settled {
                transaction,
                entry,
                subscription,
            } => {
                counter!("creditflow_payments_settled_total").increment(1);
                counter!("creditflow_ledger_entries_total", "reason" => entry.reason.as_str()).increment(1);
                info!(
                    order_id = %transaction.order_id,
                    user_id = %transaction.user_id,
                    credits = entry.delta,
                    balance_after = entry.balance_after,
                    plan = %subscription.plan,
                    "Payment settled"
                );
                Ok(VerifyOutcome::Settled(transaction))
            }
            Settlement::AlreadySettled(transaction) => {
                debug!(order_id = %transaction.order_id, "Order already settled");
                Ok(VerifyOutcome::AlreadySettled(transaction))
            }
            Settlement::NotPending(transaction) => Err(PaymentError::NotPending {
                order_id: transaction.order_id,
                status: transaction.status,
            }),
        }
    }

    /// Fail PENDING orders older than the order deadline. Returns how many were abandoned.
    pub async fn sweep_abandoned(&self) -> Result<u64> {
        let older_than = time_before(Utc::now(), self.config.order_deadline);
        let abandoned = with_retry(&self.retry, "abandon_stale_transactions", || {
            self.store.abandon_stale_transactions(older_than)
        })
        .await?;
        if abandoned > 0 {
            info!(abandoned, "Abandoned stale payment orders");
        }
        Ok(abandoned)
    }

    /// Newest first.
    pub async fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        Ok(self.store.list_user_transactions(user_id).await?)
    }

    pub async fn subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        Ok(self.store.latest_subscription(user_id).await?)
    }
}
