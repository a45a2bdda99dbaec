use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};

use crate::{
    AppState,
    api::models::{
        payments::{
            ConfirmCheckoutRequest, CreateOrderRequest, OrderResponse, SubscriptionResponse, TransactionResponse, VerifyPaymentRequest,
            VerifyPaymentResponse,
        },
        users::CurrentUser,
    },
    errors::{Error, Result},
    payments::VerifyOutcome,
};

/// Create a payment order for a plan
#[utoipa::path(
    post,
    path = "/api/v1/payments/orders",
    tag = "payments",
    summary = "Create a payment order",
    description = "Create a gateway order for the plan's price. The order stays pending until the payment is verified. \
                   Gateways with a hosted checkout return the page to send the user to as checkoutUrl.",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = OrderResponse),
        (status = 400, description = "Unknown plan"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Payment gateway unavailable"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn create_order(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>)> {
    let order = state.payments.create_order(&current_user.id, &request.plan).await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

/// Verify a completed payment and credit the account
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    tag = "payments",
    summary = "Verify a payment",
    description = "Check the gateway's payment signature and settle the order. Settling is idempotent: \
                   verifying an order twice credits it once.",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Payment verified", body = VerifyPaymentResponse),
        (status = 401, description = "Signature mismatch"),
        (status = 404, description = "No such order for this user"),
        (status = 409, description = "The order was abandoned or failed"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>> {
    if request.order_id.is_empty() || request.payment_id.is_empty() || request.signature.is_empty() {
        return Err(Error::BadRequest {
            message: "orderId, paymentId and signature are required".to_string(),
        });
    }

    let outcome = state
        .payments
        .verify(&current_user.id, &request.order_id, &request.payment_id, &request.signature)
        .await?;

    Ok(Json(VerifyPaymentResponse {
        success: true,
        already_settled: matches!(outcome, VerifyOutcome::AlreadySettled(_)),
    }))
}

/// Confirm a hosted checkout and credit the account
#[utoipa::path(
    post,
    path = "/api/v1/payments/confirm",
    tag = "payments",
    summary = "Confirm a hosted checkout",
    description = "Called when the user returns from the gateway's checkout page. The gateway is asked whether the order \
                   was paid; a paid order is settled exactly once, an unpaid one stays pending.",
    request_body = ConfirmCheckoutRequest,
    responses(
        (status = 200, description = "Payment confirmed", body = VerifyPaymentResponse),
        (status = 400, description = "Malformed order id, or a gateway without hosted checkout"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "The payment has not been completed yet"),
        (status = 404, description = "No such order for this user"),
        (status = 409, description = "The order was abandoned or failed"),
        (status = 502, description = "Payment gateway unavailable"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn confirm_checkout(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<ConfirmCheckoutRequest>,
) -> Result<Json<VerifyPaymentResponse>> {
    if request.order_id.is_empty() {
        return Err(Error::BadRequest {
            message: "orderId is required".to_string(),
        });
    }

    let outcome = state.payments.confirm_checkout(&current_user.id, &request.order_id).await?;

    Ok(Json(VerifyPaymentResponse {
        success: true,
        already_settled: matches!(outcome, VerifyOutcome::AlreadySettled(_)),
    }))
}

/// List the caller's payment transactions, newest first
#[utoipa::path(
    get,
    path = "/api/v1/payments/transactions",
    tag = "payments",
    summary = "List payment transactions",
    responses(
        (status = 200, description = "Transactions", body = [TransactionResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn list_transactions(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<Vec<TransactionResponse>>> {
    let transactions = state.payments.transactions(&current_user.id).await?;
    Ok(Json(transactions.into_iter().map(TransactionResponse::from).collect()))
}

/// Get the caller's latest subscription
#[utoipa::path(
    get,
    path = "/api/v1/payments/subscription",
    tag = "payments",
    summary = "Get the current subscription",
    responses(
        (status = 200, description = "Latest subscription", body = SubscriptionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No plan has been purchased"),
    ),
    security(
        ("X-User-Id" = [])
    )
)]
pub async fn get_subscription(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<SubscriptionResponse>> {
    let subscription = state
        .payments
        .subscription(&current_user.id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: current_user.id.clone(),
        })?;
    Ok(Json(subscription.into()))
}

#[cfg(test)]
mod tests {
    use crate::api::models::credits::BalanceResponse;
    use crate::api::models::payments::{OrderResponse, SubscriptionResponse, TransactionResponse, VerifyPaymentResponse};
    use crate::db::models::payments::TransactionStatus;
    use crate::config::StripeConfig;
    use crate::payment_providers::stripe::StripeProvider;
    use crate::test_utils::{TEST_USER_HEADER, create_test_app, create_test_app_with_gateway, create_test_config, sign_payment};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn create_order(server: &axum_test::TestServer, user: &str, plan: &str) -> OrderResponse {
        let response = server
            .post("/api/v1/payments/orders")
            .add_header(TEST_USER_HEADER, user)
            .json(&json!({"plan": plan}))
            .await;
        response.assert_status(StatusCode::CREATED);
        response.json()
    }

    #[tokio::test]
    async fn test_order_verify_credit_flow() {
        let (server, _ctx) = create_test_app().await;
        let order = create_order(&server, "gina", "basic").await;
        assert_eq!(order.amount, 400_000);
        assert_eq!(order.currency, "INR");
        assert_eq!(order.credits, 500);

        let signature = sign_payment(&order.order_id, "pay_1");
        let verify = |signature: String| {
            server
                .post("/api/v1/payments/verify")
                .add_header(TEST_USER_HEADER, "gina")
                .json(&json!({"orderId": order.order_id, "paymentId": "pay_1", "signature": signature}))
        };

        let first: VerifyPaymentResponse = verify(signature.clone()).await.json();
        assert!(first.success && !first.already_settled);

        // A replayed verification is acknowledged but credits nothing
        let second: VerifyPaymentResponse = verify(signature).await.json();
        assert!(second.success && second.already_settled);

        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "gina")
            .await
            .json();
        assert_eq!(balance.credits, 600);

        let subscription: SubscriptionResponse = server
            .get("/api/v1/payments/subscription")
            .add_header(TEST_USER_HEADER, "gina")
            .await
            .json();
        assert_eq!(subscription.plan, "basic");
        assert_eq!(subscription.order_id, order.order_id);

        let transactions: Vec<TransactionResponse> = server
            .get("/api/v1/payments/transactions")
            .add_header(TEST_USER_HEADER, "gina")
            .await
            .json();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TransactionStatus::Success);
        assert_eq!(transactions[0].payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_credit() {
        let (server, _ctx) = create_test_app().await;
        let order = create_order(&server, "hank", "premium").await;

        server
            .post("/api/v1/payments/verify")
            .add_header(TEST_USER_HEADER, "hank")
            .json(&json!({"orderId": order.order_id, "paymentId": "pay_1", "signature": sign_payment(&order.order_id, "pay_2")}))
            .await
            .assert_status_unauthorized();

        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "hank")
            .await
            .json();
        assert_eq!(balance.credits, 100);

        let transactions: Vec<TransactionResponse> = server
            .get("/api/v1/payments/transactions")
            .add_header(TEST_USER_HEADER, "hank")
            .await
            .json();
        assert_eq!(transactions[0].status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_plan_and_foreign_orders() {
        let (server, _ctx) = create_test_app().await;
        server
            .post("/api/v1/payments/orders")
            .add_header(TEST_USER_HEADER, "ivy")
            .json(&json!({"plan": "platinum"}))
            .await
            .assert_status_bad_request();

        let order = create_order(&server, "ivy", "basic").await;
        server
            .post("/api/v1/payments/verify")
            .add_header(TEST_USER_HEADER, "jack")
            .json(&json!({"orderId": order.order_id, "paymentId": "pay_1", "signature": sign_payment(&order.order_id, "pay_1")}))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn test_no_subscription_is_404() {
        let (server, _ctx) = create_test_app().await;
        server
            .get("/api/v1/payments/subscription")
            .add_header(TEST_USER_HEADER, "kim")
            .await
            .assert_status_not_found();
    }

    fn checkout_session(payment_status: &str) -> serde_json::Value {
        json!({
            "id": "cs_test_42",
            "url": "https://checkout.stripe.com/c/pay/cs_test_42",
            "amount_total": 400000,
            "currency": "inr",
            "payment_status": payment_status,
            "payment_intent": "pi_42",
        })
    }

    #[tokio::test]
    async fn test_hosted_checkout_flow() {
        let stripe = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(checkout_session("unpaid")))
            .mount(&stripe)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(checkout_session("unpaid")))
            .up_to_n_times(1)
            .mount(&stripe)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(checkout_session("paid")))
            .mount(&stripe)
            .await;

        let gateway = StripeProvider::new(StripeConfig {
            api_key: "sk_test_key".to_string(),
            webhook_secret: "whsec_test".to_string(),
            success_url: "https://app.example/credits?session_id={CHECKOUT_SESSION_ID}".parse().unwrap(),
            cancel_url: "https://app.example/credits".parse().unwrap(),
            base_url: stripe.uri().parse().unwrap(),
        })
        .unwrap();
        let (server, _ctx) = create_test_app_with_gateway(create_test_config(), Arc::new(gateway)).await;

        let order = create_order(&server, "lena", "basic").await;
        assert_eq!(order.order_id, "cs_test_42");
        assert_eq!(order.checkout_url.as_deref(), Some("https://checkout.stripe.com/c/pay/cs_test_42"));
        assert_eq!(order.key_id, None);

        let confirm = || {
            server
                .post("/api/v1/payments/confirm")
                .add_header(TEST_USER_HEADER, "lena")
                .json(&json!({"sessionId": "cs_test_42"}))
        };
        confirm().await.assert_status(StatusCode::PAYMENT_REQUIRED);

        let first: VerifyPaymentResponse = confirm().await.json();
        assert!(first.success && !first.already_settled);
        let second: VerifyPaymentResponse = confirm().await.json();
        assert!(second.success && second.already_settled);

        // Another user cannot claim the session
        server
            .post("/api/v1/payments/confirm")
            .add_header(TEST_USER_HEADER, "mark")
            .json(&json!({"orderId": "cs_test_42"}))
            .await
            .assert_status_not_found();

        let balance: BalanceResponse = server
            .get("/api/v1/credits")
            .add_header(TEST_USER_HEADER, "lena")
            .await
            .json();
        assert_eq!(balance.credits, 600);
    }

    #[tokio::test]
    async fn test_confirm_needs_a_hosted_checkout_gateway() {
        let (server, _ctx) = create_test_app().await;
        let order = create_order(&server, "nora", "basic").await;
        assert_eq!(order.checkout_url, None);

        server
            .post("/api/v1/payments/confirm")
            .add_header(TEST_USER_HEADER, "nora")
            .json(&json!({"orderId": order.order_id}))
            .await
            .assert_status_bad_request();
        server
            .post("/api/v1/payments/confirm")
            .add_header(TEST_USER_HEADER, "nora")
            .json(&json!({"orderId": ""}))
            .await
            .assert_status_bad_request();
    }
}
