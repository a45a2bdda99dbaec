use crate::types::{EntryId, JobId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

/// Why a ledger entry moved credits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryReason {
    JobDebit,
    JobRefund,
    PaymentCredit,
    /// Credits granted when the account is opened
    Grant,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::JobDebit => "JOB_DEBIT",
            EntryReason::JobRefund => "JOB_REFUND",
            EntryReason::PaymentCredit => "PAYMENT_CREDIT",
            EntryReason::Grant => "GRANT",
        }
    }

    /// Whether entries with this reason remove credits from the account.
    pub fn is_debit(&self) -> bool {
        matches!(self, EntryReason::JobDebit)
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOB_DEBIT" => Ok(EntryReason::JobDebit),
            "JOB_REFUND" => Ok(EntryReason::JobRefund),
            "PAYMENT_CREDIT" => Ok(EntryReason::PaymentCredit),
            "GRANT" => Ok(EntryReason::Grant),
            other => Err(format!("unknown ledger entry reason: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct CreditAccount {
    pub user_id: UserId,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    /// Signed change applied to the balance
    pub delta: i64,
    pub reason: EntryReason,
    pub idempotency_key: String,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub delta: i64,
    pub reason: EntryReason,
    pub idempotency_key: String,
}

/// Result of applying a ledger entry against the stored balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry was new and the balance moved
    Applied(LedgerEntry),
    /// An entry with the same idempotency key already exists; nothing changed
    Replayed(LedgerEntry),
    /// The entry would have taken the balance below zero; nothing changed
    Insufficient { balance: i64 },
}

pub fn job_debit_key(job_id: JobId) -> String {
    format!("{job_id}:debit")
}

pub fn job_refund_key(job_id: JobId) -> String {
    format!("{job_id}:refund")
}

pub fn initial_grant_key(user_id: &str) -> String {
    format!("{user_id}:initial")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reason_round_trips_through_its_wire_name() {
        for reason in [EntryReason::JobDebit, EntryReason::JobRefund, EntryReason::PaymentCredit, EntryReason::Grant] {
            assert_eq!(reason.as_str().parse::<EntryReason>().unwrap(), reason);
            assert_eq!(serde_json::to_value(reason).unwrap(), serde_json::json!(reason.as_str()));
        }
        assert!("REBATE".parse::<EntryReason>().is_err());
    }

    #[test]
    fn test_job_keys_are_distinct_per_purpose() {
        let id = Uuid::new_v4();
        assert_eq!(job_debit_key(id), format!("{id}:debit"));
        assert_eq!(job_refund_key(id), format!("{id}:refund"));
        assert_ne!(job_debit_key(id), job_refund_key(id));
    }
}
