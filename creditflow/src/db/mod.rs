//! Persistence layer.
//!
//! The [`Storage`] trait is the single mutation point for balances, job state and payment status.
//! Every mutation is a conditional update against the stored value: a balance moves only when the
//! result stays non-negative, a job moves only from the state the caller observed, a transaction
//! settles only while PENDING. Callers never read-then-write.
//!
//! Two backends implement it:
//! - [`in_memory::InMemoryStorage`]: one lock over all tables, for tests and single-process runs
//! - `postgres::PostgresStorage` (feature `postgres`): `sqlx` against the schema in `migrations/`

pub mod errors;
pub mod in_memory;
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;


use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::types::{Job, JobState, JobTransition, NewJob, PollUpdate};
use crate::types::JobId;
use errors::Result;
use models::credits::{CreditAccount, EntryOutcome, LedgerEntry, NewLedgerEntry};
use models::payments::{NewTransaction, SettleRequest, Settlement, Subscription, Transaction};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account if missing, granting `initial_credits` once (key `"{user}:initial"`).
    async fn ensure_account(&self, user_id: &str, initial_credits: i64) -> Result<CreditAccount>;

    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>>;

    /// Apply one entry atomically. An existing entry with the same idempotency key is returned
    /// unchanged as [`EntryOutcome::Replayed`].
    async fn apply_entry(&self, entry: &NewLedgerEntry) -> Result<EntryOutcome>;

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>>;

    /// Newest first.
    async fn list_entries(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &NewJob) -> Result<Job>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn get_job_by_correlation(&self, correlation_id: &str) -> Result<Option<Job>>;

    /// Newest first.
    async fn list_user_jobs(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<Job>>;

    /// Compare-and-set: apply `transition` only if the job is currently in `from`.
    /// Returns `None` if the job is missing or has moved on.
    async fn transition_job(&self, id: JobId, from: JobState, transition: &JobTransition) -> Result<Option<Job>>;

    /// Update poll bookkeeping, only while the job is SUBMITTED.
    async fn record_poll(&self, id: JobId, update: &PollUpdate) -> Result<Option<Job>>;

    /// SUBMITTED jobs whose next poll is at or before `now`, earliest first.
    async fn due_for_poll(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// CREATED or DEBITED jobs last touched before `older_than`.
    async fn stale_unsubmitted(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// FAILED jobs that have a debit entry but no refund entry.
    async fn jobs_missing_refund(&self, limit: i64) -> Result<Vec<Job>>;

    /// Returns `true` the first time a (correlation id, event id) pair is seen.
    async fn record_webhook_event(&self, correlation_id: &str, event_id: &str) -> Result<bool>;

    /// Forget webhook events received before `older_than`; returns how many.
    async fn prune_webhook_events(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<Transaction>;

    async fn get_transaction_by_order(&self, order_id: &str) -> Result<Option<Transaction>>;

    /// Newest first.
    async fn list_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>>;

    /// In one unit: PENDING → SUCCESS, a PAYMENT_CREDIT entry keyed by the order id, and a
    /// Subscription row. Fails with [`errors::DbError::NotFound`] for an unknown order.
    async fn settle_transaction(&self, request: &SettleRequest) -> Result<Settlement>;

    /// PENDING → FAILED. Returns the transaction as stored afterwards, `None` if unknown.
    async fn fail_transaction(&self, order_id: &str) -> Result<Option<Transaction>>;

    /// Marks PENDING transactions created before `older_than` as FAILED; returns how many.
    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn latest_subscription(&self, user_id: &str) -> Result<Option<Subscription>>;
}

/// Everything the service persists.
pub trait Storage: LedgerStore + JobStore + PaymentStore {}

impl<T: LedgerStore + JobStore + PaymentStore> Storage for T {}
