use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::credits::{CreditAccount, EntryReason, LedgerEntry};
use crate::types::EntryId;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub credits: i64,
    pub last_updated: DateTime<Utc>,
}

impl From<CreditAccount> for BalanceResponse {
    fn from(account: CreditAccount) -> Self {
        Self {
            credits: account.balance,
            last_updated: account.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: EntryId,
    pub delta: i64,
    pub reason: EntryReason,
    pub idempotency_key: String,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for LedgerEntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            delta: entry.delta,
            reason: entry.reason,
            idempotency_key: entry.idempotency_key,
            balance_after: entry.balance_after,
            created_at: entry.created_at,
        }
    }
}
