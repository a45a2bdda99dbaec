//! In-memory storage implementation.
//!
//! All tables live behind a single `parking_lot::RwLock`, so each trait method is one critical
//! section and therefore atomic with respect to every other method. The lock is never held across
//! an `.await`. Suitable for tests and single-process deployments; data is lost on restart.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::errors::{DbError, Result};
use super::models::credits::{
    initial_grant_key, job_debit_key, job_refund_key, CreditAccount, EntryOutcome, EntryReason, LedgerEntry, NewLedgerEntry,
};
use super::models::payments::{NewTransaction, SettleRequest, Settlement, Subscription, Transaction, TransactionStatus};
use super::{JobStore, LedgerStore, PaymentStore};
use crate::jobs::types::{Job, JobState, JobTransition, NewJob, PollUpdate};
use crate::types::{JobId, UserId};

#[derive(Default)]
struct Tables {
    accounts: HashMap<UserId, CreditAccount>,
    /// Append-only, in application order
    entries: Vec<LedgerEntry>,
    entries_by_key: HashMap<String, usize>,
    jobs: HashMap<JobId, Job>,
    jobs_by_correlation: HashMap<String, JobId>,
    /// (correlation id, event id) → received at
    webhook_events: HashMap<(String, String), DateTime<Utc>>,
    transactions: HashMap<String, Transaction>,
    subscriptions: Vec<Subscription>,
}

impl Tables {
    fn apply_entry(&mut self, entry: &NewLedgerEntry, now: DateTime<Utc>) -> EntryOutcome {
        if let Some(&index) = self.entries_by_key.get(&entry.idempotency_key) {
            return EntryOutcome::Replayed(self.entries[index].clone());
        }

        let account = self.accounts.entry(entry.user_id.clone()).or_insert_with(|| CreditAccount {
            user_id: entry.user_id.clone(),
            balance: 0,
            updated_at: now,
        });

        let balance_after = account.balance + entry.delta;
        if balance_after < 0 {
            return EntryOutcome::Insufficient { balance: account.balance };
        }
        account.balance = balance_after;
        account.updated_at = now;

        let stored = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id.clone(),
            delta: entry.delta,
            reason: entry.reason,
            idempotency_key: entry.idempotency_key.clone(),
            balance_after,
            created_at: now,
        };
        self.entries_by_key.insert(stored.idempotency_key.clone(), self.entries.len());
        self.entries.push(stored.clone());
        EntryOutcome::Applied(stored)
    }

    fn has_entry(&self, key: &str) -> bool {
        self.entries_by_key.contains_key(key)
    }
}

/// In-memory implementation of the [`Storage`](super::Storage) trait.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStorage {
    async fn ensure_account(&self, user_id: &str, initial_credits: i64) -> Result<CreditAccount> {
        let now = Utc::now();
        let mut tables = self.tables.write();

        if let Some(account) = tables.accounts.get(user_id) {
            return Ok(account.clone());
        }

        tables.accounts.insert(
            user_id.to_string(),
            CreditAccount {
                user_id: user_id.to_string(),
                balance: 0,
                updated_at: now,
            },
        );

        if initial_credits > 0 {
            tables.apply_entry(
                &NewLedgerEntry {
                    user_id: user_id.to_string(),
                    delta: initial_credits,
                    reason: EntryReason::Grant,
                    idempotency_key: initial_grant_key(user_id),
                },
                now,
            );
        }

        tables
            .accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| DbError::Other(anyhow::anyhow!("account for {user_id} vanished during creation")))
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>> {
        Ok(self.tables.read().accounts.get(user_id).cloned())
    }

    async fn apply_entry(&self, entry: &NewLedgerEntry) -> Result<EntryOutcome> {
        Ok(self.tables.write().apply_entry(entry, Utc::now()))
    }

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables.entries_by_key.get(idempotency_key).map(|&index| tables.entries[index].clone()))
    }

    async fn list_entries(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for InMemoryStorage {
    async fn insert_job(&self, job: &NewJob) -> Result<Job> {
        let now = Utc::now();
        let mut tables = self.tables.write();

        if tables.jobs.contains_key(&job.id) {
            return Err(DbError::UniqueViolation {
                constraint: Some("jobs_pkey".to_string()),
                table: Some("jobs".to_string()),
                message: format!("job {} already exists", job.id),
            });
        }

        let stored = Job {
            id: job.id,
            user_id: job.user_id.clone(),
            kind: job.kind,
            payload: job.payload.clone(),
            external_correlation_id: None,
            state: JobState::Created,
            failure_reason: None,
            failure_detail: None,
            cost_in_credits: job.cost_in_credits,
            result_ref: None,
            retry_of: job.retry_of,
            poll_attempts: 0,
            status_errors: 0,
            next_poll_at: None,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.jobs.insert(job.id, stored.clone());
        Ok(stored)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn get_job_by_correlation(&self, correlation_id: &str) -> Result<Option<Job>> {
        let tables = self.tables.read();
        Ok(tables
            .jobs_by_correlation
            .get(correlation_id)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn list_user_jobs(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        let mut jobs: Vec<&Job> = tables.jobs.values().filter(|j| j.user_id == user_id).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn transition_job(&self, id: JobId, from: JobState, transition: &JobTransition) -> Result<Option<Job>> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.state != from {
            return Ok(None);
        }

        if let Some(correlation_id) = &transition.external_correlation_id {
            if tables.jobs_by_correlation.get(correlation_id).is_some_and(|other| *other != id) {
                return Err(DbError::UniqueViolation {
                    constraint: Some("jobs_external_correlation_id_key".to_string()),
                    table: Some("jobs".to_string()),
                    message: format!("correlation id {correlation_id} already belongs to another job"),
                });
            }
            tables.jobs_by_correlation.insert(correlation_id.clone(), id);
            job.external_correlation_id = Some(correlation_id.clone());
        }

        job.state = transition.to;
        if transition.result_ref.is_some() {
            job.result_ref = transition.result_ref.clone();
        }
        if transition.failure_reason.is_some() {
            job.failure_reason = transition.failure_reason;
        }
        if transition.failure_detail.is_some() {
            job.failure_detail = transition.failure_detail.clone();
        }
        if transition.submitted_at.is_some() {
            job.submitted_at = transition.submitted_at;
        }
        job.next_poll_at = transition.next_poll_at;
        job.updated_at = Utc::now();

        Ok(Some(job.clone()))
    }

    async fn record_poll(&self, id: JobId, update: &PollUpdate) -> Result<Option<Job>> {
        let mut tables = self.tables.write();
        match tables.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Submitted => {
                job.poll_attempts = update.poll_attempts;
                job.status_errors = update.status_errors;
                job.next_poll_at = Some(update.next_poll_at);
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn due_for_poll(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        let mut due: Vec<&Job> = tables
            .jobs
            .values()
            .filter(|j| j.state == JobState::Submitted && j.next_poll_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|j| j.next_poll_at);
        Ok(due.into_iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn stale_unsubmitted(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        let mut stale: Vec<&Job> = tables
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Created | JobState::Debited) && j.updated_at < older_than)
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale.into_iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn jobs_missing_refund(&self, limit: i64) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        Ok(tables
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Failed && tables.has_entry(&job_debit_key(j.id)) && !tables.has_entry(&job_refund_key(j.id))
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_webhook_event(&self, correlation_id: &str, event_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.webhook_events.entry((correlation_id.to_string(), event_id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn prune_webhook_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.webhook_events.len();
        tables.webhook_events.retain(|_, received_at| *received_at >= older_than);
        Ok((before - tables.webhook_events.len()) as u64)
    }
}

#[async_trait]
impl PaymentStore for InMemoryStorage {
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<Transaction> {
        let now = Utc::now();
        let mut tables = self.tables.write();

        if tables.transactions.contains_key(&transaction.order_id) {
            return Err(DbError::UniqueViolation {
                constraint: Some("transactions_order_id_key".to_string()),
                table: Some("transactions".to_string()),
                message: format!("order {} already recorded", transaction.order_id),
            });
        }

        let stored = Transaction {
            id: Uuid::new_v4(),
            user_id: transaction.user_id.clone(),
            order_id: transaction.order_id.clone(),
            payment_id: None,
            payment_proof: None,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            plan: transaction.plan.clone(),
            credits: transaction.credits,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        tables.transactions.insert(stored.order_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_transaction_by_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        Ok(self.tables.read().transactions.get(order_id).cloned())
    }

    async fn list_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let tables = self.tables.read();
        let mut transactions: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    async fn settle_transaction(&self, request: &SettleRequest) -> Result<Settlement> {
        let now = Utc::now();
        let mut tables = self.tables.write();

        let transaction = tables.transactions.get(&request.order_id).cloned().ok_or(DbError::NotFound)?;
        match transaction.status {
            TransactionStatus::Success => return Ok(Settlement::AlreadySettled(transaction)),
            TransactionStatus::Failed => return Ok(Settlement::NotPending(transaction)),
            TransactionStatus::Pending => {}
        }

        let credit = NewLedgerEntry {
            user_id: transaction.user_id.clone(),
            delta: transaction.credits,
            reason: EntryReason::PaymentCredit,
            idempotency_key: transaction.order_id.clone(),
        };
        let entry = match tables.apply_entry(&credit, now) {
            EntryOutcome::Applied(entry) | EntryOutcome::Replayed(entry) => entry,
            EntryOutcome::Insufficient { .. } => {
                return Err(DbError::Other(anyhow::anyhow!("payment credit for order {} was refused", request.order_id)));
            }
        };

        let settled = tables.transactions.get_mut(&request.order_id).ok_or(DbError::NotFound)?;
        settled.status = TransactionStatus::Success;
        settled.payment_id = Some(request.payment_id.clone());
        settled.payment_proof = request.payment_proof.clone();
        settled.updated_at = now;
        let transaction = settled.clone();

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: transaction.user_id.clone(),
            plan: transaction.plan.clone(),
            order_id: transaction.order_id.clone(),
            created_at: now,
        };
        tables.subscriptions.push(subscription.clone());

        Ok(Settlement::Settled {
            transaction,
            entry,
            subscription,
        })
    }

    async fn fail_transaction(&self, order_id: &str) -> Result<Option<Transaction>> {
        let mut tables = self.tables.write();
        Ok(tables.transactions.get_mut(order_id).map(|transaction| {
            if transaction.status == TransactionStatus::Pending {
                transaction.status = TransactionStatus::Failed;
                transaction.updated_at = Utc::now();
            }
            transaction.clone()
        }))
    }

    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut tables = self.tables.write();
        let mut abandoned = 0;
        for transaction in tables.transactions.values_mut() {
            if transaction.status == TransactionStatus::Pending && transaction.created_at < older_than {
                transaction.status = TransactionStatus::Failed;
                transaction.updated_at = now;
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    async fn latest_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        Ok(self
            .tables
            .read()
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id)
            .cloned())
    }
}
