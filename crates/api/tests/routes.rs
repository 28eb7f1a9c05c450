//! Router tests against the in-memory store and a mocked GoPay API

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use bulldogo_api::{create_router, AppState, Config};
use bulldogo_billing::{
    client::PriceIds, AccountPlanRecord, BillingService, GoPayClient, GoPayConfig, InMemoryStore,
    PaymentRecord, PlanStore, StripeConfig,
};
use bulldogo_shared::{AccountId, OrderNumber, PaymentState, PlanId};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use mockito::{Matcher, ServerGuard};
use serde_json::{json, Value};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;

const JWT_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";
const WEBHOOK_SECRET: &str = "whsec_test_secret";

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "https://api.bulldogo.test".to_string(),
        frontend_url: "https://bulldogo.test".to_string(),
        cors_origins: vec!["https://bulldogo.test".to_string()],
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        jwt_secret: JWT_SECRET.to_string(),
        enable_payments: true,
        enable_stripe_sync: true,
    }
}

fn gopay_config(url: &str) -> GoPayConfig {
    GoPayConfig {
        client_id: "8123456789".to_string(),
        client_secret: "secret".to_string(),
        goid: 8123456789,
        api_url: url.to_string(),
        is_test: true,
    }
}

fn stripe_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_unused".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        price_ids: PriceIds {
            hobby: Some("price_hobby".to_string()),
            business: Some("price_business".to_string()),
        },
    }
}

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
}

fn app(gopay_url: Option<&str>, stripe: Option<StripeConfig>) -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let plan_store: Arc<dyn PlanStore> = store.clone();
    let billing = BillingService::new(plan_store, stripe);
    let gopay = gopay_url.map(|url| GoPayClient::new(gopay_config(url)));
    let router = create_router(AppState::new(test_config(), billing, gopay));
    TestApp { router, store }
}

fn bearer(account: &str) -> String {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = json!({
        "sub": account,
        "aud": "authenticated",
        "role": "authenticated",
        "iat": now,
        "exp": now + 3600,
    });
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn mock_token(server: &mut ServerGuard) {
    server
        .mock("POST", "/oauth2/token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"access_token":"tok"}"#)
        .create_async()
        .await;
}

async fn mock_status(server: &mut ServerGuard, id: i64, order: &str, state: &str) {
    server
        .mock("GET", format!("/payments/payment/{}", id).as_str())
        .with_status(200)
        .with_body(
            json!({
                "id": id,
                "order_number": order,
                "state": state,
                "amount": 19900,
                "currency": "CZK"
            })
            .to_string(),
        )
        .create_async()
        .await;
}

async fn seed_payment(store: &InMemoryStore, order: &str, gateway_id: i64, account: &str) {
    let now = OffsetDateTime::now_utc();
    store
        .insert_payment(&PaymentRecord {
            order_number: OrderNumber::new(order),
            gateway_id: Some(gateway_id),
            account_id: AccountId::from(account),
            plan_id: Some(PlanId::Hobby),
            plan_name: Some("Hobby".to_string()),
            amount_minor: 19900,
            currency: "CZK".to_string(),
            state: PaymentState::Created,
            plan_activated: false,
            plan_activated_at: None,
            gateway_response: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let app = app(None, None);

    let (status, body) = send(
        &app.router,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "healthy");

    let (status, _) = send(
        &app.router,
        Request::get("/health/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Plan management
// =============================================================================

#[tokio::test]
async fn test_plan_routes_require_bearer_token() {
    let app = app(None, None);

    let (status, body) = send(&app.router, Request::get("/plan").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, body) = send(
        &app.router,
        Request::get("/plan")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_plan_view_cancel_and_undo() {
    let app = app(None, None);
    let now = OffsetDateTime::now_utc();
    let mut record = AccountPlanRecord::empty(AccountId::from("owner-1"));
    record.plan_id = PlanId::Business;
    record.period_start = Some(now - Duration::days(10));
    record.period_end = Some(now + Duration::days(20));
    record.duration_days = Some(30);
    app.store.insert_plan(record).await;

    let (status, body) = send(
        &app.router,
        Request::get("/plan")
            .header(header::AUTHORIZATION, bearer("owner-1"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "business");
    assert_eq!(body["active"], true);
    assert!(body["cancel_at"].is_null());

    let (status, body) = send(
        &app.router,
        Request::post("/plan/cancel")
            .header(header::AUTHORIZATION, bearer("owner-1"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_at"], body["period_end"]);

    let (status, body) = send(
        &app.router,
        Request::post("/plan/cancel/undo")
            .header(header::AUTHORIZATION, bearer("owner-1"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cancel_at"].is_null());
}

#[tokio::test]
async fn test_cancel_without_plan_is_not_found() {
    let app = app(None, None);
    let (status, _) = send(
        &app.router,
        Request::post("/plan/cancel")
            .header(header::AUTHORIZATION, bearer("nobody"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Payments
// =============================================================================

#[tokio::test]
async fn test_create_payment_validates_fields() {
    let app = app(Some("http://127.0.0.1:1"), None);

    let (status, body) = send(
        &app.router,
        Request::post("/payments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"amount": 199, "orderNumber": "ORD-1"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app.router,
        Request::post("/payments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "amount": 0,
                    "orderNumber": "ORD-1",
                    "orderDescription": "Hobby",
                    "userId": "owner-1",
                    "planId": "hobby",
                    "planName": "Hobby"
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Amount must be greater than 0");
}

#[tokio::test]
async fn test_create_payment_records_checkout() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    let create = server
        .mock("POST", "/payments/payment")
        .match_body(Matcher::PartialJson(json!({
            "amount": 19900,
            "order_number": "ORD-NEW",
            "items": [{"name": "Hobby", "amount": 19900, "count": 1}],
            "notification_url": "https://api.bulldogo.test/gopay/notification",
            "return_url": "https://api.bulldogo.test/payments/return"
        })))
        .with_status(200)
        .with_body(
            json!({
                "id": 777,
                "order_number": "ORD-NEW",
                "state": "CREATED",
                "gw_url": "https://gw.sandbox.gopay.com/gw/v3/xyz"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let app = app(Some(&server.url()), None);
    let (status, body) = send(
        &app.router,
        Request::post("/payments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "amount": 199,
                    "orderNumber": "ORD-NEW",
                    "orderDescription": "Balíček Hobby",
                    "userId": "owner-1",
                    "planId": "hobby",
                    "planName": "Hobby",
                    "payerEmail": "owner@example.com"
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;

    create.assert_async().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["paymentId"], 777);
    assert_eq!(body["gwUrl"], "https://gw.sandbox.gopay.com/gw/v3/xyz");

    let record = app
        .store
        .payment_record(&OrderNumber::new("ORD-NEW"))
        .await
        .unwrap();
    assert_eq!(record.gateway_id, Some(777));
    assert_eq!(record.amount_minor, 19900);
    assert_eq!(record.plan_id, Some(PlanId::Hobby));
    assert!(!record.plan_activated);
}

#[tokio::test]
async fn test_check_payment_requires_identifier() {
    let app = app(Some("http://127.0.0.1:1"), None);
    let (status, body) = send(
        &app.router,
        Request::get("/payments/check").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Missing paymentId or orderNumber");
}

#[tokio::test]
async fn test_check_payment_activates_paid_order() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    mock_status(&mut server, 555, "ORD-CHECK", "PAID").await;

    let app = app(Some(&server.url()), None);
    seed_payment(&app.store, "ORD-CHECK", 555, "owner-2").await;

    let (status, body) = send(
        &app.router,
        Request::get("/payments/check?paymentId=555&orderNumber=ORD-CHECK")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payment"]["state"], "PAID");
    assert_eq!(body["payment"]["amount"], 199.0);
    assert_eq!(body["payment"]["orderNumber"], "ORD-CHECK");

    let plan = app.store.plan_record(&AccountId::from("owner-2")).await.unwrap();
    assert_eq!(plan.plan_id, PlanId::Hobby);
    assert_eq!(plan.duration_days, Some(30));

    let payment = app
        .store
        .payment_record(&OrderNumber::new("ORD-CHECK"))
        .await
        .unwrap();
    assert!(payment.plan_activated);
    let (checked, notified) = app
        .store
        .payment_delivery_times(&OrderNumber::new("ORD-CHECK"))
        .await;
    assert!(checked.is_some());
    assert!(notified.is_none());
}

#[tokio::test]
async fn test_check_payment_rejects_payment_of_another_order() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    mock_status(&mut server, 600, "ORD-PAID", "PAID").await;

    let app = app(Some(&server.url()), None);
    seed_payment(&app.store, "ORD-PAID", 600, "owner-5").await;
    seed_payment(&app.store, "ORD-OTHER", 601, "owner-6").await;

    let (status, body) = send(
        &app.router,
        Request::get("/payments/check?paymentId=600&orderNumber=ORD-OTHER")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let other = app
        .store
        .payment_record(&OrderNumber::new("ORD-OTHER"))
        .await
        .unwrap();
    assert_eq!(other.state, PaymentState::Created);
    assert!(!other.plan_activated);
    assert!(app
        .store
        .plan_record(&AccountId::from("owner-6"))
        .await
        .is_none());
    assert_eq!(app.store.plan_writes().await, 0);
}

#[tokio::test]
async fn test_check_payment_surfaces_gateway_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth2/token")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body(r#"{"errors":[{"message":"GoPay down"}]}"#)
        .create_async()
        .await;

    let app = app(Some(&server.url()), None);
    let (status, body) = send(
        &app.router,
        Request::get("/payments/check?paymentId=1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "GATEWAY_ERROR");
}

#[tokio::test]
async fn test_notification_activates_once_and_always_answers_ok() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    mock_status(&mut server, 901, "ORD-NOTIFY", "PAID").await;
    mock_status(&mut server, 902, "ORD-UNKNOWN", "PAID").await;

    let app = app(Some(&server.url()), None);
    seed_payment(&app.store, "ORD-NOTIFY", 901, "owner-3").await;

    let notify = || {
        Request::post("/gopay/notification")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"id": 901}"#))
            .unwrap()
    };

    let response = app.router.clone().oneshot(notify()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let plan = app.store.plan_record(&AccountId::from("owner-3")).await.unwrap();
    assert_eq!(plan.plan_id, PlanId::Hobby);
    let writes = app.store.plan_writes().await;

    let response = app.router.clone().oneshot(notify()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.store.plan_writes().await, writes);
    assert_eq!(
        app.store.plan_record(&AccountId::from("owner-3")).await.unwrap(),
        plan
    );

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/gopay/notification?id=902")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/gopay/notification")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payment_return_redirects_to_packages() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    mock_status(&mut server, 321, "ORD-RET", "PAID").await;

    let app = app(Some(&server.url()), None);
    seed_payment(&app.store, "ORD-RET", 321, "owner-4").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/payments/return?idPaymentSession=321&state=PAID")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://bulldogo.test/packages.html?payment=PAID&orderNumber=ORD-RET&paymentId=321"
    );
    assert!(app
        .store
        .payment_record(&OrderNumber::new("ORD-RET"))
        .await
        .unwrap()
        .plan_activated);

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/payments/return").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://bulldogo.test/packages.html?payment=unknown"
    );
}

#[tokio::test]
async fn test_payment_return_with_mismatched_order_is_error() {
    let mut server = mockito::Server::new_async().await;
    mock_token(&mut server).await;
    mock_status(&mut server, 700, "ORD-ELSEWHERE", "PAID").await;

    let app = app(Some(&server.url()), None);
    seed_payment(&app.store, "ORD-RET2", 700, "owner-7").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/payments/return?idPaymentSession=700&state=PAID")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://bulldogo.test/packages.html?payment=error"
    );
    assert!(!app
        .store
        .payment_record(&OrderNumber::new("ORD-RET2"))
        .await
        .unwrap()
        .plan_activated);
    assert!(app
        .store
        .plan_record(&AccountId::from("owner-7"))
        .await
        .is_none());
}

// =============================================================================
// Stripe webhook
// =============================================================================

fn stripe_signature(payload: &str, secret: &str, t: i64) -> String {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(format!("{}.{}", t, payload).as_bytes());
    format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn test_stripe_webhook_signature_handling() {
    let app = app(None, Some(stripe_config()));
    let payload = r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#;

    let (status, _) = send(
        &app.router,
        Request::post("/stripe/webhook")
            .header("stripe-signature", "t=1,v1=deadbeef")
            .body(Body::from(payload))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/stripe/webhook")
                .header("stripe-signature", stripe_signature(payload, WEBHOOK_SECRET, now))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_stripe_webhook_unavailable_without_config() {
    let app = app(None, None);
    let (status, _) = send(
        &app.router,
        Request::post("/stripe/webhook")
            .header("stripe-signature", "t=1,v1=deadbeef")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
