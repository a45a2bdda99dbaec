use axum::{
    extract::{Query, State},
    response::Json,
};

use crate::{
    AppState,
    api::models::{
        credits::{BalanceResponse, LedgerEntryResponse},
        pagination::Pagination,
        users::CurrentUser,
    },
    errors::Result,
};

/// Get the caller's credit balance
#[utoipa::path(
    get,
    path = "/api/v1/credits",
    tag = "credits",
    summary = "Get credit balance",
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn get_balance(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<BalanceResponse>> {
    let account = state.ledger.balance(&current_user.id).await?;
    Ok(Json(account.into()))
}

/// List the caller's ledger entries, newest first
#[utoipa::path(
    get,
    path = "/api/v1/credits/entries",
    tag = "credits",
    summary = "List ledger entries",
    params(Pagination),
    responses(
        (status = 200, description = "Ledger entries", body = [LedgerEntryResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn list_entries(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    current_user: CurrentUser,
) -> Result<Json<Vec<LedgerEntryResponse>>> {
    let entries = state
        .ledger
        .entries(&current_user.id, pagination.skip(), pagination.limit())
        .await?;
    Ok(Json(entries.into_iter().map(LedgerEntryResponse::from).collect()))
}

#[cfg(test)]
mod tests {
    use crate::api::models::credits::{BalanceResponse, LedgerEntryResponse};
    use crate::db::models::credits::EntryReason;
    use crate::test_utils::{TEST_USER_HEADER, create_test_app};
    use serde_json::json;

    #[tokio::test]
    async fn test_first_request_grants_initial_credits_once() {
        let (server, _ctx) = create_test_app().await;

        for _ in 0..3 {
            let balance: BalanceResponse = server
                .get("/api/v1/credits")
                .add_header(TEST_USER_HEADER, "erin")
                .await
                .json();
            assert_eq!(balance.credits, 100);
        }

        let entries: Vec<LedgerEntryResponse> = server
            .get("/api/v1/credits/entries")
            .add_header(TEST_USER_HEADER, "erin")
            .await
            .json();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, EntryReason::Grant);
        assert_eq!(entries[0].idempotency_key, "erin:initial");
    }

    #[tokio::test]
    async fn test_entries_are_paginated_newest_first() {
        let (server, _ctx) = create_test_app().await;
        for _ in 0..3 {
            server
                .post("/api/v1/jobs")
                .add_header(TEST_USER_HEADER, "frank")
                .json(&json!({"kind": "GENERATE", "payload": {"prompt": "waves"}}))
                .await;
        }

        let page: Vec<LedgerEntryResponse> = server
            .get("/api/v1/credits/entries?skip=0&limit=2")
            .add_header(TEST_USER_HEADER, "frank")
            .await
            .json();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|e| e.reason == EntryReason::JobDebit));
        assert_eq!(page[0].balance_after, 97);

        let rest: Vec<LedgerEntryResponse> = server
            .get("/api/v1/credits/entries?skip=2&limit=10")
            .add_header(TEST_USER_HEADER, "frank")
            .await
            .json();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.last().map(|e| e.reason), Some(EntryReason::Grant));
    }

    #[tokio::test]
    async fn test_balance_requires_identity() {
        let (server, _ctx) = create_test_app().await;
        server.get("/api/v1/credits").await.assert_status_unauthorized();
    }
}
