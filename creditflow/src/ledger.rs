//! Credit ledger: the only component that moves balances.
//!
//! Every mutation goes through [`CreditLedger::debit`] or [`CreditLedger::credit`] with an
//! idempotency key. Replaying a key returns the entry recorded the first time and leaves the
//! balance alone, which is what lets the orchestrator, the poller and the payment reconciler
//! retry blindly.

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::db::errors::DbError;
use crate::db::models::credits::{CreditAccount, EntryOutcome, EntryReason, LedgerEntry, NewLedgerEntry};
use crate::db::Storage;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Invalid amount {0}: must be positive")]
    InvalidAmount(i64),

    #[error("{0} entries cannot be issued as credits")]
    InvalidReason(EntryReason),

    #[error(transparent)]
    Database(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Idempotently create the user's account, granting `initial_credits` on first creation.
    #[instrument(skip(self), err)]
    pub async fn open_account(&self, user_id: &str, initial_credits: i64) -> Result<CreditAccount> {
        Ok(with_retry(&self.retry, "ensure_account", || self.store.ensure_account(user_id, initial_credits)).await?)
    }

    /// Remove `amount` credits, failing without any mutation if the balance is too low.
    #[instrument(skip(self))]
    pub async fn debit(&self, user_id: &str, amount: i64, idempotency_key: &str) -> Result<LedgerEntry> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.apply(NewLedgerEntry {
            user_id: user_id.to_string(),
            delta: -amount,
            reason: EntryReason::JobDebit,
            idempotency_key: idempotency_key.to_string(),
        })
        .await
    }

    /// Add `amount` credits.
    #[instrument(skip(self), err)]
    pub async fn credit(&self, user_id: &str, amount: i64, reason: EntryReason, idempotency_key: &str) -> Result<LedgerEntry> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if reason.is_debit() {
            return Err(LedgerError::InvalidReason(reason));
        }
        self.apply(NewLedgerEntry {
            user_id: user_id.to_string(),
            delta: amount,
            reason,
            idempotency_key: idempotency_key.to_string(),
        })
        .await
    }

    async fn apply(&self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let outcome = with_retry(&self.retry, "apply_entry", || self.store.apply_entry(&entry)).await?;
        match outcome {
            EntryOutcome::Applied(applied) => {
                counter!("creditflow_ledger_entries_total", "reason" => applied.reason.as_str()).increment(1);
                info!(
                    user_id = %applied.user_id,
                    delta = applied.delta,
                    balance_after = applied.balance_after,
                    key = %applied.idempotency_key,
                    "Ledger entry applied"
                );
                Ok(applied)
            }
            EntryOutcome::Replayed(original) => {
                counter!("creditflow_ledger_replays_total").increment(1);
                debug!(key = %original.idempotency_key, "Idempotency key replayed, returning original entry");
                Ok(original)
            }
            EntryOutcome::Insufficient { balance } => Err(LedgerError::InsufficientCredits {
                balance,
                required: -entry.delta,
            }),
        }
    }

    /// Current balance; users without an account have zero.
    pub async fn balance(&self, user_id: &str) -> Result<CreditAccount> {
        Ok(self.store.get_account(user_id).await?.unwrap_or_else(|| CreditAccount {
            user_id: user_id.to_string(),
            balance: 0,
            updated_at: chrono::Utc::now(),
        }))
    }

    pub async fn entries(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        Ok(self.store.list_entries(user_id, skip, limit).await?)
    }

    pub async fn entry(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.store.get_entry_by_key(idempotency_key).await?)
    }
}
