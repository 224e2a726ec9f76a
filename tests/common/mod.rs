//! Shared harness for HTTP-level tests: a real router over a throwaway
//! SQLite database, with scripted stand-ins for the payment gateway and the
//! slot-availability service.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, Response};
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use marketplace_api::auth::SessionService;
use marketplace_api::clients::{
    AddressSnapshot, GatewaySession, PaymentGateway, PaymentState, SlotAvailability,
};
use marketplace_api::config::AppConfig;
use marketplace_api::entities::session;
use marketplace_api::errors::ServiceError;
use marketplace_api::events::EventSender;
use marketplace_api::handlers::{AppServices, CART_TOKEN_HEADER};
use marketplace_api::services::addresses::AddressService;
use marketplace_api::services::carts::CartService;
use marketplace_api::services::checkout::CheckoutService;
use marketplace_api::services::order_status::OrderStatusService;
use marketplace_api::services::orders::OrderService;
use marketplace_api::services::pricing::{PricingService, QuoteCoalescer, StaticTaxTable};
use marketplace_api::services::reservations::ReservationChecker;
use marketplace_api::{app_router, AppState};

const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Gateway whose sessions are staged by the test.
pub struct ScriptedGateway {
    sessions: Mutex<HashMap<String, GatewaySession>>,
}

impl ScriptedGateway {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn stage(&self, session: GatewaySession) {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServiceError::UpstreamUnavailable("gateway offline".to_string()))
    }
}

/// Availability source where every slot is free unless a test blocks it.
pub struct ScriptedAvailability {
    blocked: Mutex<HashSet<(Uuid, String, String)>>,
}

impl ScriptedAvailability {
    fn new() -> Self {
        Self {
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub async fn block(&self, product_id: Uuid, date: &str, time: &str) {
        self.blocked
            .lock()
            .await
            .insert((product_id, date.to_string(), time.to_string()));
    }

    pub async fn unblock(&self, product_id: Uuid, date: &str, time: &str) {
        self.blocked
            .lock()
            .await
            .remove(&(product_id, date.to_string(), time.to_string()));
    }
}

#[async_trait]
impl SlotAvailability for ScriptedAvailability {
    async fn check(
        &self,
        product_id: Uuid,
        date: &str,
        time: &str,
    ) -> Result<bool, ServiceError> {
        let blocked = self.blocked.lock().await;
        Ok(!blocked.contains(&(product_id, date.to_string(), time.to_string())))
    }
}

pub struct TestApp {
    _dir: tempfile::TempDir,
    pub db: Arc<DatabaseConnection>,
    pub router: Router,
    pub gateway: Arc<ScriptedGateway>,
    pub availability: Arc<ScriptedAvailability>,
}

pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let db = Arc::new(
        marketplace_api::db::establish_connection(&url)
            .await
            .expect("connect"),
    );
    marketplace_api::db::run_migrations(&db)
        .await
        .expect("migrate");

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
    let event_sender = Arc::new(EventSender::new(event_tx));
    tokio::spawn(marketplace_api::events::process_events(event_rx));

    let gateway = Arc::new(ScriptedGateway::new());
    let availability = Arc::new(ScriptedAvailability::new());
    let coalescer = Arc::new(QuoteCoalescer::new());

    let sessions = Arc::new(SessionService::new(db.clone()));
    let orders = Arc::new(OrderService::new(db.clone()));
    let order_status = Arc::new(OrderStatusService::new(db.clone(), event_sender.clone()));
    let reservations = Arc::new(ReservationChecker::new(
        db.clone(),
        availability.clone(),
        event_sender.clone(),
        coalescer.clone(),
        UPSTREAM_TIMEOUT,
    ));
    let carts = Arc::new(CartService::new(
        db.clone(),
        event_sender.clone(),
        reservations.clone(),
        coalescer.clone(),
    ));
    let pricing = Arc::new(PricingService::new(
        Arc::new(StaticTaxTable::new(dec!(0.08))),
        coalescer.clone(),
        dec!(5.99),
        dec!(50.00),
        UPSTREAM_TIMEOUT,
    ));
    let checkout = Arc::new(CheckoutService::new(
        db.clone(),
        gateway.clone(),
        orders.clone(),
        carts.clone(),
        pricing.clone(),
        coalescer,
        event_sender.clone(),
        UPSTREAM_TIMEOUT,
    ));
    let addresses = Arc::new(AddressService::new(db.clone()));

    let state = AppState {
        db: db.clone(),
        config: AppConfig::new(url, "127.0.0.1".to_string(), 0, "development".to_string()),
        event_sender,
        services: AppServices {
            sessions,
            checkout,
            order_status,
            orders,
            carts,
            addresses,
            pricing,
            reservations,
        },
    };

    TestApp {
        _dir: dir,
        db,
        router: app_router(state),
        gateway,
        availability,
    }
}

impl TestApp {
    /// Insert a live session row and return its bearer token.
    pub async fn seed_session(&self, role: &str) -> (String, Uuid) {
        let token = format!("tok-{}", Uuid::new_v4().simple());
        let user_id = Uuid::new_v4();
        let row = session::ActiveModel {
            id: Set(Uuid::new_v4()),
            token_hash: Set(SessionService::hash_token(&token)),
            user_id: Set(user_id),
            role: Set(role.to_string()),
            expires_at: Set(Utc::now() + chrono::Duration::hours(1)),
            created_at: Set(Utc::now()),
        };
        session::Entity::insert(row)
            .exec(&*self.db)
            .await
            .expect("seed session");
        (token, user_id)
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        cart_token: Option<&str>,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(token) = cart_token {
            builder = builder.header(CART_TOKEN_HEADER, token);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn get(&self, path: &str, bearer: Option<&str>) -> Response<Body> {
        self.send(Method::GET, path, bearer, None, None).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> Response<Body> {
        self.send(Method::POST, path, bearer, None, Some(body)).await
    }
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn decimal_field(value: &Value, field: &str) -> Decimal {
    let raw = &value[field];
    let text = raw
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_string());
    text.parse().unwrap_or_else(|_| panic!("{} not a decimal: {}", field, raw))
}

pub fn paid_session(id: &str, intent: &str, owner_key: &str) -> GatewaySession {
    GatewaySession {
        id: id.to_string(),
        payment_state: PaymentState::Paid,
        payment_intent_id: intent.to_string(),
        cart_owner_key: owner_key.to_string(),
        payment_method: Some("card".to_string()),
        shipping_address: Some(AddressSnapshot {
            street: "350 Fifth Ave".to_string(),
            apartment: None,
            city: "New York".to_string(),
            state: "NY".to_string(),
            zip: "10001".to_string(),
            country: "US".to_string(),
        }),
    }
}

pub fn grocery_item(store_id: Uuid, price: &str, quantity: i32) -> Value {
    serde_json::json!({
        "storeId": store_id,
        "storeName": "Corner Deli",
        "productId": Uuid::new_v4(),
        "productName": "Olive Oil",
        "quantity": quantity,
        "unitPrice": price,
    })
}
