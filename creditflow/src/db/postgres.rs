//! PostgreSQL storage implementation.
//!
//! Every mutation is either a single conditional `UPDATE … WHERE <expected state>` or a short
//! transaction. Balance changes rely on the row lock taken by `UPDATE credit_accounts`, which
//! serializes concurrent entries for the same user while leaving other users unaffected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use uuid::Uuid;

use super::errors::{DbError, Result};
use super::models::credits::{initial_grant_key, CreditAccount, EntryOutcome, EntryReason, LedgerEntry, NewLedgerEntry};
use super::models::payments::{NewTransaction, SettleRequest, Settlement, Subscription, Transaction, TransactionStatus};
use super::{JobStore, LedgerStore, PaymentStore};
use crate::jobs::types::{Job, JobState, JobTransition, NewJob, PollUpdate};
use crate::types::JobId;

/// Embedded schema migrations from `migrations/`.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then apply pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        migrator().run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply one ledger entry on an open transaction.
///
/// Returns [`DbError::UniqueViolation`] when a concurrent transaction committed an entry with the
/// same key after our initial lookup; the caller must roll back and re-read.
async fn apply_entry_in(conn: &mut PgConnection, entry: &NewLedgerEntry) -> Result<EntryOutcome> {
    let existing = sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE idempotency_key = $1")
        .bind(&entry.idempotency_key)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(existing) = existing {
        return Ok(EntryOutcome::Replayed(existing));
    }

    sqlx::query("INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(&entry.user_id)
        .execute(&mut *conn)
        .await?;

    let balance_after: Option<i64> = sqlx::query_scalar(
        "UPDATE credit_accounts SET balance = balance + $2, updated_at = now() \
         WHERE user_id = $1 AND balance + $2 >= 0 RETURNING balance",
    )
    .bind(&entry.user_id)
    .bind(entry.delta)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(balance_after) = balance_after else {
        let balance: i64 = sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE user_id = $1")
            .bind(&entry.user_id)
            .fetch_one(&mut *conn)
            .await?;
        return Ok(EntryOutcome::Insufficient { balance });
    };

    let inserted = sqlx::query_as::<_, LedgerEntry>(
        "INSERT INTO ledger_entries (id, user_id, delta, reason, idempotency_key, balance_after) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (idempotency_key) DO NOTHING RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&entry.user_id)
    .bind(entry.delta)
    .bind(entry.reason)
    .bind(&entry.idempotency_key)
    .bind(balance_after)
    .fetch_optional(&mut *conn)
    .await?;

    inserted.map(EntryOutcome::Applied).ok_or_else(|| DbError::UniqueViolation {
        constraint: Some("ledger_entries_idempotency_key_unique".to_string()),
        table: Some("ledger_entries".to_string()),
        message: format!("concurrent entry for key {}", entry.idempotency_key),
    })
}

#[async_trait]
impl LedgerStore for PostgresStorage {
    #[tracing::instrument(skip(self), err)]
    async fn ensure_account(&self, user_id: &str, initial_credits: i64) -> Result<CreditAccount> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, CreditAccount>(
            "INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING RETURNING *",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if created.is_some() && initial_credits > 0 {
            let grant = NewLedgerEntry {
                user_id: user_id.to_string(),
                delta: initial_credits,
                reason: EntryReason::Grant,
                idempotency_key: initial_grant_key(user_id),
            };
            apply_entry_in(&mut tx, &grant).await?;
        }

        let account = sqlx::query_as::<_, CreditAccount>("SELECT * FROM credit_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>> {
        Ok(sqlx::query_as::<_, CreditAccount>("SELECT * FROM credit_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    #[tracing::instrument(skip(self, entry), fields(user_id = %entry.user_id, key = %entry.idempotency_key), err)]
    async fn apply_entry(&self, entry: &NewLedgerEntry) -> Result<EntryOutcome> {
        let mut tx = self.pool.begin().await?;
        match apply_entry_in(&mut tx, entry).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(DbError::UniqueViolation { .. }) => {
                tx.rollback().await?;
                self.get_entry_by_key(&entry.idempotency_key)
                    .await?
                    .map(EntryOutcome::Replayed)
                    .ok_or(DbError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_entry_by_key(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        Ok(sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_entries(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        Ok(sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE user_id = $1 ORDER BY created_at DESC, id DESC OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl JobStore for PostgresStorage {
    async fn insert_job(&self, job: &NewJob) -> Result<Job> {
        Ok(sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (id, user_id, kind, payload, state, cost_in_credits, retry_of) \
             VALUES ($1, $2, $3, $4, 'CREATED', $5, $6) RETURNING *",
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(job.kind)
        .bind(&job.payload)
        .bind(job.cost_in_credits)
        .bind(job.retry_of)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_job_by_correlation(&self, correlation_id: &str) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE external_correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_user_jobs(&self, user_id: &str, skip: i64, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE user_id = $1 ORDER BY created_at DESC, id DESC OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    #[tracing::instrument(skip(self, transition), fields(to = %transition.to), err)]
    async fn transition_job(&self, id: JobId, from: JobState, transition: &JobTransition) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "UPDATE jobs SET \
                state = $3, \
                external_correlation_id = COALESCE($4, external_correlation_id), \
                result_ref = COALESCE($5, result_ref), \
                failure_reason = COALESCE($6, failure_reason), \
                failure_detail = COALESCE($7, failure_detail), \
                submitted_at = COALESCE($8, submitted_at), \
                next_poll_at = $9, \
                updated_at = clock_timestamp() \
             WHERE id = $1 AND state = $2 RETURNING *",
        )
        .bind(id)
        .bind(from)
        .bind(transition.to)
        .bind(&transition.external_correlation_id)
        .bind(&transition.result_ref)
        .bind(transition.failure_reason)
        .bind(&transition.failure_detail)
        .bind(transition.submitted_at)
        .bind(transition.next_poll_at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_poll(&self, id: JobId, update: &PollUpdate) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "UPDATE jobs SET poll_attempts = $2, status_errors = $3, next_poll_at = $4, updated_at = clock_timestamp() \
             WHERE id = $1 AND state = 'SUBMITTED' RETURNING *",
        )
        .bind(id)
        .bind(update.poll_attempts)
        .bind(update.status_errors)
        .bind(update.next_poll_at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn due_for_poll(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE state = 'SUBMITTED' AND next_poll_at <= $1 ORDER BY next_poll_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn stale_unsubmitted(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE state IN ('CREATED', 'DEBITED') AND updated_at < $1 ORDER BY updated_at LIMIT $2",
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn jobs_missing_refund(&self, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT j.* FROM jobs j \
             WHERE j.state = 'FAILED' \
               AND EXISTS (SELECT 1 FROM ledger_entries e WHERE e.idempotency_key = j.id::text || ':debit') \
               AND NOT EXISTS (SELECT 1 FROM ledger_entries e WHERE e.idempotency_key = j.id::text || ':refund') \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_webhook_event(&self, correlation_id: &str, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (correlation_id, event_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(correlation_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_webhook_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE received_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentStore for PostgresStorage {
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<Transaction> {
        Ok(sqlx::query_as::<_, Transaction>(
            "INSERT INTO transactions (id, user_id, order_id, amount, currency, plan, credits, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING') RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&transaction.user_id)
        .bind(&transaction.order_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.plan)
        .bind(transaction.credits)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_transaction_by_order(&self, order_id: &str) -> Result<Option<Transaction>> {
        Ok(sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        Ok(
            sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id), err)]
    async fn settle_transaction(&self, request: &SettleRequest) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Transaction>(
            "UPDATE transactions SET status = 'SUCCESS', payment_id = $2, payment_proof = $3, updated_at = clock_timestamp() \
             WHERE order_id = $1 AND status = 'PENDING' RETURNING *",
        )
        .bind(&request.order_id)
        .bind(&request.payment_id)
        .bind(&request.payment_proof)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction) = updated else {
            let current = sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE order_id = $1")
                .bind(&request.order_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(DbError::NotFound)?;
            return Ok(match current.status {
                TransactionStatus::Success => Settlement::AlreadySettled(current),
                _ => Settlement::NotPending(current),
            });
        };

        let credit = NewLedgerEntry {
            user_id: transaction.user_id.clone(),
            delta: transaction.credits,
            reason: EntryReason::PaymentCredit,
            idempotency_key: transaction.order_id.clone(),
        };
        let entry = match apply_entry_in(&mut tx, &credit).await? {
            EntryOutcome::Applied(entry) | EntryOutcome::Replayed(entry) => entry,
            EntryOutcome::Insufficient { .. } => {
                return Err(DbError::Other(anyhow::anyhow!(
                    "payment credit for order {} was refused",
                    request.order_id
                )));
            }
        };

        let subscription = sqlx::query_as::<_, Subscription>(
            "INSERT INTO subscriptions (id, user_id, plan, order_id) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&transaction.user_id)
        .bind(&transaction.plan)
        .bind(&transaction.order_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Settlement::Settled {
            transaction,
            entry,
            subscription,
        })
    }

    async fn fail_transaction(&self, order_id: &str) -> Result<Option<Transaction>> {
        let failed = sqlx::query_as::<_, Transaction>(
            "UPDATE transactions SET status = 'FAILED', updated_at = clock_timestamp() \
             WHERE order_id = $1 AND status = 'PENDING' RETURNING *",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        match failed {
            Some(transaction) => Ok(Some(transaction)),
            None => self.get_transaction_by_order(order_id).await,
        }
    }

    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE transactions SET status = 'FAILED', updated_at = clock_timestamp() \
             WHERE status = 'PENDING' AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
